//! Engine-side pane observation.
//!
//! The tracker consumes the daemon's event stream and answers the questions
//! the injection engine and recovery manager ask: how long since output,
//! did new output follow a submit, is the prompt ready, and is apparent
//! activity just a thinking-timer repaint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use base64::Engine;
use hive_protocol::{AgentMode, DaemonMessage, PaneId};
use tokio::sync::broadcast;
use tracing::debug;

/// Claude-style TUIs render `❯` (U+276F) at the start of the input line
/// when ready for input.
const PROMPT_MARKER: char = '\u{276f}';

/// Bounded text tail kept per pane for prompt/heartbeat inspection.
const TAIL_CAP: usize = 2048;

/// A recorded child exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    pub code: Option<i32>,
    pub expected: bool,
}

#[derive(Debug, Default)]
struct PaneActivity {
    alive: bool,
    gracefully_completed: bool,
    last_exit: Option<ExitRecord>,
    /// Monotonic output byte counter; verify marks snapshot this.
    total_bytes: u64,
    last_output: Option<Instant>,
    /// Last exec activity event.
    last_event: Option<Instant>,
    spawned_at: Option<Instant>,
    /// ANSI-stripped rolling tail of output text.
    tail: String,
    /// Progress signals for recovery: tokens vs thinking-timer repaints.
    last_token_change: Option<Instant>,
    last_timer_advance: Option<Instant>,
    last_timer_value: Option<u64>,
    last_masked_chunk: String,
}

/// Shared observer over all panes. Cheap to clone.
#[derive(Clone, Default)]
pub struct PaneTracker {
    inner: Arc<Mutex<HashMap<PaneId, PaneActivity>>>,
}

impl PaneTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task feeding this tracker from a daemon event subscription.
    pub fn observe(
        &self,
        mut events: broadcast::Receiver<DaemonMessage>,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(msg) => tracker.apply(&msg),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(event = "engine.tracker.events_lagged", skipped = skipped);
                    }
                }
            }
        })
    }

    /// Fold one daemon event into the per-pane state.
    pub fn apply(&self, msg: &DaemonMessage) {
        match msg {
            DaemonMessage::Spawned { pane_id, .. } => {
                let mut map = self.lock();
                let pane = map.entry(*pane_id).or_default();
                *pane = PaneActivity {
                    alive: true,
                    spawned_at: Some(Instant::now()),
                    ..PaneActivity::default()
                };
            }
            DaemonMessage::Data { pane_id, data } => {
                let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(data) else {
                    return;
                };
                let mut map = self.lock();
                let pane = map.entry(*pane_id).or_default();
                pane.record_output(&bytes);
            }
            DaemonMessage::Activity { pane_id, .. } => {
                let mut map = self.lock();
                let pane = map.entry(*pane_id).or_default();
                pane.last_event = Some(Instant::now());
            }
            DaemonMessage::Exit {
                pane_id,
                code,
                expected,
            } => {
                let mut map = self.lock();
                let pane = map.entry(*pane_id).or_default();
                pane.alive = false;
                pane.last_exit = Some(ExitRecord {
                    code: *code,
                    expected: *expected,
                });
                if *code == Some(0) && !expected {
                    pane.gracefully_completed = true;
                }
            }
            _ => {}
        }
    }

    pub fn is_alive(&self, pane_id: PaneId) -> bool {
        self.lock().get(&pane_id).is_some_and(|p| p.alive)
    }

    pub fn last_exit(&self, pane_id: PaneId) -> Option<ExitRecord> {
        self.lock().get(&pane_id).and_then(|p| p.last_exit)
    }

    pub fn gracefully_completed(&self, pane_id: PaneId) -> bool {
        self.lock()
            .get(&pane_id)
            .is_some_and(|p| p.gracefully_completed)
    }

    /// Time since the pane last produced output. `None` = no output yet.
    pub fn last_output_age(&self, pane_id: PaneId) -> Option<Duration> {
        self.lock()
            .get(&pane_id)
            .and_then(|p| p.last_output)
            .map(|t| t.elapsed())
    }

    /// Snapshot the output byte counter; pair with `bytes_since`.
    pub fn output_marker(&self, pane_id: PaneId) -> u64 {
        self.lock().get(&pane_id).map_or(0, |p| p.total_bytes)
    }

    pub fn bytes_since(&self, pane_id: PaneId, marker: u64) -> u64 {
        self.lock()
            .get(&pane_id)
            .map_or(0, |p| p.total_bytes.saturating_sub(marker))
    }

    /// Whether the pane's tail shows a ready prompt marker.
    pub fn prompt_ready(&self, pane_id: PaneId) -> bool {
        self.lock().get(&pane_id).is_some_and(|p| {
            p.tail
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .is_some_and(|line| line.starts_with(PROMPT_MARKER))
        })
    }

    /// Age of the last *real* progress for recovery purposes.
    ///
    /// Interactive panes: token changes count, and so does an advancing
    /// thinking timer (a thinking stall is not stuck); a frozen timer stops
    /// both clocks. Exec panes: the last structured event. Falls back to
    /// spawn time so a silent fresh pane eventually trips the threshold.
    pub fn progress_age(&self, pane_id: PaneId, mode: AgentMode) -> Option<Duration> {
        let map = self.lock();
        let pane = map.get(&pane_id)?;
        let progress_at = match mode {
            AgentMode::Interactive => [
                pane.last_token_change,
                pane.last_timer_advance,
                pane.spawned_at,
            ]
            .into_iter()
            .flatten()
            .max(),
            AgentMode::Exec => [pane.last_event, pane.last_output, pane.spawned_at]
                .into_iter()
                .flatten()
                .max(),
            _ => [pane.last_event, pane.last_output, pane.spawned_at]
                .into_iter()
                .flatten()
                .max(),
        };
        progress_at.map(|t| t.elapsed())
    }
}

impl PaneTracker {
    fn lock(&self) -> MutexGuard<'_, HashMap<PaneId, PaneActivity>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl PaneActivity {
    fn record_output(&mut self, bytes: &[u8]) {
        let now = Instant::now();
        self.total_bytes += bytes.len() as u64;
        self.last_output = Some(now);

        let text = strip_ansi(&String::from_utf8_lossy(bytes));
        if text.is_empty() {
            return;
        }

        self.tail.push_str(&text);
        if self.tail.len() > TAIL_CAP {
            let cut = self.tail.len() - TAIL_CAP;
            // Trim at a char boundary at or after the cut point.
            let boundary = (cut..self.tail.len())
                .find(|&i| self.tail.is_char_boundary(i))
                .unwrap_or(0);
            self.tail = self.tail.split_off(boundary);
        }

        // Thinking-timer heartbeat: an advancing `(NNs)` counter with an
        // otherwise-identical repaint is a heartbeat, not token progress.
        if let Some(value) = last_timer_value(&text) {
            if self.last_timer_value != Some(value) {
                self.last_timer_value = Some(value);
                self.last_timer_advance = Some(now);
            }
        }

        let masked = mask_timers(&text);
        let masked_trimmed = masked.trim();
        if !masked_trimmed.is_empty() && masked_trimmed != self.last_masked_chunk {
            self.last_masked_chunk = masked_trimmed.to_string();
            self.last_token_change = Some(now);
        }
    }
}

/// Extract the last `(NNs)` timer value from a text chunk.
fn last_timer_value(text: &str) -> Option<u64> {
    timer_regex()
        .captures_iter(text)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Replace timer digits so repaints that only advance the counter compare
/// equal.
fn mask_timers(text: &str) -> String {
    timer_regex().replace_all(text, "(Ns)").into_owned()
}

fn timer_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\((\d+)s\)").unwrap_or_else(|_| unreachable!()))
}

/// Remove CSI/OSC escape sequences and lone ESC bytes from terminal output.
fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{001B}' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            // CSI: ESC [ params... final byte in @..~
            Some('[') => {
                chars.next();
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7E}').contains(&c) {
                        break;
                    }
                }
            }
            // OSC: ESC ] ... terminated by BEL or ESC \
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\u{0007}' {
                        break;
                    }
                    if c == '\u{001B}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            // Two-char escapes (ESC c, ESC =, …)
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_msg(pane: u32, bytes: &[u8]) -> DaemonMessage {
        DaemonMessage::Data {
            pane_id: PaneId::new(pane),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    fn spawned_msg(pane: u32) -> DaemonMessage {
        DaemonMessage::Spawned {
            id: None,
            pane_id: PaneId::new(pane),
            mode: AgentMode::Interactive,
            pid: Some(1),
            session_id: None,
        }
    }

    #[test]
    fn test_output_marker_and_bytes_since() {
        let tracker = PaneTracker::new();
        tracker.apply(&spawned_msg(1));

        let mark = tracker.output_marker(PaneId::new(1));
        assert_eq!(mark, 0);

        tracker.apply(&data_msg(1, b"hello"));
        assert_eq!(tracker.bytes_since(PaneId::new(1), mark), 5);
        assert!(tracker.last_output_age(PaneId::new(1)).is_some());
    }

    #[test]
    fn test_prompt_ready_detection() {
        let tracker = PaneTracker::new();
        tracker.apply(&spawned_msg(1));
        assert!(!tracker.prompt_ready(PaneId::new(1)));

        tracker.apply(&data_msg(1, "done.\n\u{276f} \n".as_bytes()));
        assert!(tracker.prompt_ready(PaneId::new(1)));

        // New output pushes the prompt away
        tracker.apply(&data_msg(1, b"working...\n"));
        assert!(!tracker.prompt_ready(PaneId::new(1)));
    }

    #[test]
    fn test_prompt_detection_ignores_ansi_noise() {
        let tracker = PaneTracker::new();
        tracker.apply(&spawned_msg(2));
        tracker.apply(&data_msg(
            2,
            "\u{001B}[2K\u{001B}[1G\u{276f} \u{001B}[0m".as_bytes(),
        ));
        assert!(tracker.prompt_ready(PaneId::new(2)));
    }

    #[test]
    fn test_exit_marks_not_alive_and_graceful() {
        let tracker = PaneTracker::new();
        tracker.apply(&spawned_msg(1));
        assert!(tracker.is_alive(PaneId::new(1)));

        tracker.apply(&DaemonMessage::Exit {
            pane_id: PaneId::new(1),
            code: Some(0),
            expected: false,
        });
        assert!(!tracker.is_alive(PaneId::new(1)));
        assert!(tracker.gracefully_completed(PaneId::new(1)));
        assert_eq!(
            tracker.last_exit(PaneId::new(1)),
            Some(ExitRecord {
                code: Some(0),
                expected: false
            })
        );
    }

    #[test]
    fn test_expected_exit_not_graceful() {
        let tracker = PaneTracker::new();
        tracker.apply(&spawned_msg(1));
        tracker.apply(&DaemonMessage::Exit {
            pane_id: PaneId::new(1),
            code: Some(0),
            expected: true,
        });
        assert!(!tracker.gracefully_completed(PaneId::new(1)));
    }

    #[test]
    fn test_timer_repaint_is_not_token_progress() {
        let tracker = PaneTracker::new();
        tracker.apply(&spawned_msg(1));

        tracker.apply(&data_msg(1, "\u{2733} Thinking\u{2026} (41s)".as_bytes()));
        let after_first = {
            let map = tracker.lock();
            map[&PaneId::new(1)].last_token_change
        };
        assert!(after_first.is_some());

        std::thread::sleep(Duration::from_millis(10));

        // Same text, advanced timer: timer clock moves, token clock doesn't.
        tracker.apply(&data_msg(1, "\u{2733} Thinking\u{2026} (42s)".as_bytes()));
        let map = tracker.lock();
        let pane = &map[&PaneId::new(1)];
        assert_eq!(pane.last_token_change, after_first);
        assert_eq!(pane.last_timer_value, Some(42));
        assert!(pane.last_timer_advance > after_first);
    }

    #[test]
    fn test_token_change_updates_progress() {
        let tracker = PaneTracker::new();
        tracker.apply(&spawned_msg(1));
        tracker.apply(&data_msg(1, b"alpha"));
        let first = {
            let map = tracker.lock();
            map[&PaneId::new(1)].last_token_change
        };
        std::thread::sleep(Duration::from_millis(10));
        tracker.apply(&data_msg(1, b"beta"));
        let map = tracker.lock();
        assert!(map[&PaneId::new(1)].last_token_change > first);
    }

    #[test]
    fn test_progress_age_exec_uses_events() {
        let tracker = PaneTracker::new();
        tracker.apply(&spawned_msg(1));
        tracker.apply(&DaemonMessage::Activity {
            pane_id: PaneId::new(1),
            kind: hive_protocol::ActivityKind::Tool,
        });
        let age = tracker
            .progress_age(PaneId::new(1), AgentMode::Exec)
            .unwrap();
        assert!(age < Duration::from_secs(1));
    }

    #[test]
    fn test_progress_age_unknown_pane_none() {
        let tracker = PaneTracker::new();
        assert!(tracker
            .progress_age(PaneId::new(5), AgentMode::Interactive)
            .is_none());
    }

    #[test]
    fn test_strip_ansi_csi_and_osc() {
        assert_eq!(strip_ansi("a\u{001B}[31mred\u{001B}[0mb"), "aredb");
        assert_eq!(strip_ansi("x\u{001B}]0;title\u{0007}y"), "xy");
        assert_eq!(strip_ansi("x\u{001B}]0;title\u{001B}\\y"), "xy");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_mask_timers() {
        assert_eq!(mask_timers("Thinking (41s) done"), "Thinking (Ns) done");
        assert_eq!(last_timer_value("a (3s) b (17s)"), Some(17));
        assert_eq!(last_timer_value("no timers"), None);
    }

    #[test]
    fn test_tail_is_bounded() {
        let tracker = PaneTracker::new();
        tracker.apply(&spawned_msg(1));
        for _ in 0..100 {
            tracker.apply(&data_msg(1, &[b'x'; 256]));
        }
        let map = tracker.lock();
        assert!(map[&PaneId::new(1)].tail.len() <= TAIL_CAP);
    }
}

//! Trigger router: watches the mailbox directory, deduplicates by
//! `(sender, seq, recipient)`, fans out to panes through the injection
//! engine, and advances sequence cursors only on delivery acknowledgement.

pub mod mailbox;
pub mod sequences;
pub mod watcher;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use hive_paths::HivePaths;
use hive_protocol::{DeliveryId, Role};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityEvent, ActivitySink, preview_of};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::inject::{InjectionEngine, InjectionRequest};
use crate::roster::Roster;
use mailbox::{clear_trigger_file, decode_bytes, normalize, parse_message, read_trigger_with_retry};
use sequences::SequenceStore;
use watcher::TriggerWatcher;

pub struct TriggerRouter {
    paths: HivePaths,
    config: EngineConfig,
    roster: Arc<Roster>,
    injector: InjectionEngine,
    sequences: Arc<Mutex<SequenceStore>>,
    sink: Arc<dyn ActivitySink>,
    /// When we last cleared each trigger file; empties inside the window
    /// are our own clear re-firing the watcher.
    recent_clears: Mutex<HashMap<PathBuf, Instant>>,
}

impl TriggerRouter {
    pub fn new(
        paths: HivePaths,
        config: EngineConfig,
        roster: Arc<Roster>,
        injector: InjectionEngine,
        sink: Arc<dyn ActivitySink>,
    ) -> Result<Self, EngineError> {
        let sequences = SequenceStore::load(&paths.message_state_file())?;
        Ok(Self {
            paths,
            config,
            roster,
            injector,
            sequences: Arc::new(Mutex::new(sequences)),
            sink,
            recent_clears: Mutex::new(HashMap::new()),
        })
    }

    /// Shared handle to the sequence store (used by the CLI's outbound
    /// allocation and by tests).
    pub fn sequences(&self) -> Arc<Mutex<SequenceStore>> {
        Arc::clone(&self.sequences)
    }

    /// Watch the mailbox until shutdown. Debounces rapid change events and
    /// processes the pending path set together.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), EngineError> {
        let triggers_dir = self.paths.triggers_dir();
        let mut watcher = TriggerWatcher::new(&triggers_dir)?;

        // Messages written while the engine was down still count.
        self.sweep_existing(&triggers_dir).await;

        let debounce = Duration::from_millis(self.config.debounce_ms);
        let mut pending: HashSet<PathBuf> = HashSet::new();
        let mut flush_at: Option<tokio::time::Instant> = None;

        loop {
            let flush_deadline =
                flush_at.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                changed = watcher.recv() => {
                    match changed {
                        Some(path) => {
                            pending.insert(path);
                            flush_at.get_or_insert(tokio::time::Instant::now() + debounce);
                        }
                        None => {
                            warn!(event = "engine.router.watcher_closed");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(flush_deadline), if flush_at.is_some() => {
                    flush_at = None;
                    let batch: Vec<PathBuf> = pending.drain().collect();
                    for path in batch {
                        if let Err(e) = self.process_trigger(&path).await {
                            // Per-message isolation: log and move on.
                            error!(
                                event = "engine.router.process_failed",
                                path = %path.display(),
                                error = %e,
                            );
                        }
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        Ok(())
    }

    /// Process any trigger files that already have content.
    async fn sweep_existing(&self, triggers_dir: &Path) {
        let entries = match std::fs::read_dir(triggers_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(event = "engine.router.sweep_failed", error = %e);
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                continue;
            }
            if let Err(e) = self.process_trigger(&path).await {
                error!(
                    event = "engine.router.sweep_process_failed",
                    path = %path.display(),
                    error = %e,
                );
            }
        }
    }

    /// The per-message pipeline: read, normalize, dedup, fan out, clear,
    /// track acknowledgement.
    pub async fn process_trigger(&self, path: &Path) -> Result<(), EngineError> {
        let Some(recipient) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
        else {
            return Ok(());
        };

        let raw = read_trigger_with_retry(path).await?;
        let text = normalize(&decode_bytes(&raw));

        if text.trim().is_empty() {
            // A successful delivery clears the file, which re-fires the
            // watcher; that empty read is noise, not a lost message.
            if self.recently_cleared(path) {
                debug!(
                    event = "engine.router.empty_after_clear",
                    path = %path.display(),
                );
            } else {
                debug!(event = "engine.router.empty_trigger", path = %path.display());
            }
            return Ok(());
        }

        let parsed = parse_message(&text);
        let is_broadcast = self.roster.is_broadcast(&recipient);

        let agents = match self.roster.resolve(&recipient) {
            Ok(agents) => agents,
            Err(e) => {
                error!(
                    event = "engine.router.unknown_recipient",
                    recipient = %recipient,
                    error = %e,
                );
                self.clear(path)?;
                return Ok(());
            }
        };

        // Dedup by (sender, seq, recipient); broadcasts are not
        // sequence-tracked.
        if !is_broadcast && let Some(header) = &parsed.header {
            let mut store = lock_sequences(&self.sequences);
            if parsed.session_banner && header.seq == 1 {
                info!(
                    event = "engine.router.session_reset",
                    recipient = %recipient,
                    sender = %header.sender,
                );
                store.reset_sender(&recipient, &header.sender)?;
            }
            let last_seen = store.last_seen(&recipient, &header.sender);
            if header.seq <= last_seen {
                info!(
                    event = "engine.router.skipped_duplicate",
                    recipient = %recipient,
                    sender = %header.sender,
                    seq = header.seq,
                    last_seen = last_seen,
                    "SKIPPED duplicate",
                );
                drop(store);
                self.clear(path)?;
                return Ok(());
            }
        }

        // Fan out with a small stagger so one agent isn't drowned by
        // simultaneous submissions.
        let mut deliveries = Vec::with_capacity(agents.len());
        let mut recipients = Vec::with_capacity(agents.len());
        for (index, agent) in agents.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.stagger_ms)).await;
            }
            let delivery_id = DeliveryId::new(uuid::Uuid::new_v4().to_string());
            let outcome = self.injector.submit(InjectionRequest {
                pane_id: agent.pane_id,
                mode: agent.mode,
                text: parsed.body.clone(),
                delivery_id: delivery_id.clone(),
                banner: agent.identity_banner.clone(),
            });
            recipients.push(agent.role.clone());
            deliveries.push((delivery_id, agent.role.clone(), outcome));
        }

        // Clear after successful enqueue; re-firing the watcher is expected.
        self.clear(path)?;

        let sender_role = parsed.header.as_ref().map(|h| Role::new(h.sender.clone()));
        self.sink.emit(ActivityEvent {
            action: "trigger",
            recipients,
            preview: preview_of(&text),
            sender_role,
            mode: agents.first().map(|a| a.mode),
            delivery_id: deliveries.first().map(|(id, _, _)| id.clone()),
        });

        // Delivery tracking: the cursor advances only after at least one
        // recipient acknowledges within the window.
        let header = parsed.header.clone();
        let sequences = Arc::clone(&self.sequences);
        let sink = Arc::clone(&self.sink);
        let ack_timeout = Duration::from_millis(self.config.ack_timeout_ms);
        let recipient_key = recipient.clone();
        tokio::spawn(async move {
            let tracked = deliveries.into_iter().map(|(delivery_id, role, outcome)| {
                let sink = Arc::clone(&sink);
                async move {
                    match tokio::time::timeout(ack_timeout, outcome).await {
                        Ok(outcome) if outcome.acked() => {
                            debug!(
                                event = "engine.router.delivery_acked",
                                delivery_id = %delivery_id,
                                role = %role,
                                outcome = ?outcome,
                            );
                            true
                        }
                        Ok(outcome) => {
                            warn!(
                                event = "engine.router.delivery_failed",
                                delivery_id = %delivery_id,
                                role = %role,
                                outcome = ?outcome,
                            );
                            false
                        }
                        Err(_) => {
                            warn!(
                                event = "engine.router.delivery_timeout",
                                delivery_id = %delivery_id,
                                role = %role,
                                "delivery timeout",
                            );
                            sink.emit(ActivityEvent {
                                action: "delivery_timeout",
                                recipients: vec![role.clone()],
                                preview: String::new(),
                                sender_role: None,
                                mode: None,
                                delivery_id: Some(delivery_id.clone()),
                            });
                            false
                        }
                    }
                }
            });
            let acks = futures::future::join_all(tracked).await;
            let any_ack = acks.into_iter().any(|acked| acked);

            if any_ack
                && !is_broadcast
                && let Some(header) = header
            {
                let mut store = lock_sequences(&sequences);
                if let Err(e) =
                    store.record_delivered(&recipient_key, &header.sender, header.seq)
                {
                    warn!(
                        event = "engine.router.cursor_advance_failed",
                        recipient = %recipient_key,
                        sender = %header.sender,
                        error = %e,
                    );
                }
            }
        });

        Ok(())
    }

    fn clear(&self, path: &Path) -> Result<(), EngineError> {
        self.mark_cleared(path);
        clear_trigger_file(path)
    }

    fn mark_cleared(&self, path: &Path) {
        let mut clears = match self.recent_clears.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        clears.insert(path.to_path_buf(), Instant::now());
    }

    fn recently_cleared(&self, path: &Path) -> bool {
        let clears = match self.recent_clears.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        clears.get(path).is_some_and(|at| {
            at.elapsed() < Duration::from_millis(self.config.clear_suppress_ms)
        })
    }
}

fn lock_sequences(sequences: &Arc<Mutex<SequenceStore>>) -> MutexGuard<'_, SequenceStore> {
    match sequences.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

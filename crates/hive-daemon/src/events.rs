use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

use base64::Engine;
use hive_protocol::{DaemonMessage, PaneId};
use tokio::sync::broadcast;
use tracing::error;

use crate::scrollback::ScrollbackBuffer;

/// Internal notifications from per-pane backend tasks to the server loop.
#[derive(Debug)]
pub enum PaneInternalEvent {
    /// The pane's child exited (or its reader hit EOF/error).
    Exited {
        pane_id: PaneId,
        code: Option<i32>,
    },
    /// An exec child announced its session identifier.
    SessionCaptured {
        pane_id: PaneId,
        session_id: String,
    },
}

/// Shared sinks every backend reader task feeds.
///
/// Cloned into each spawned task so output handling stays uniform across
/// PTY, exec, and mock backends.
#[derive(Clone)]
pub struct OutputSinks {
    pub pane_id: PaneId,
    pub events_tx: broadcast::Sender<DaemonMessage>,
    pub scrollback: Arc<Mutex<ScrollbackBuffer>>,
    /// Last output instant as epoch milliseconds; 0 = never.
    pub last_activity: Arc<AtomicI64>,
    pub internal_tx: tokio::sync::mpsc::UnboundedSender<PaneInternalEvent>,
}

impl OutputSinks {
    /// Record an output chunk: scrollback, activity timestamp, broadcast.
    pub fn feed(&self, data: &[u8]) {
        lock_scrollback(&self.scrollback, self.pane_id).push(data);
        self.last_activity
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        // Ignore send errors — no receivers means no one is attached
        let _ = self.events_tx.send(DaemonMessage::Data {
            pane_id: self.pane_id,
            data: base64::engine::general_purpose::STANDARD.encode(data),
        });
    }

    /// Broadcast a semantic activity event and bump the activity timestamp.
    pub fn activity(&self, kind: hive_protocol::ActivityKind) {
        self.last_activity
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        let _ = self.events_tx.send(DaemonMessage::Activity {
            pane_id: self.pane_id,
            kind,
        });
    }

    /// Notify the server loop that this pane's child is gone.
    pub fn exited(&self, code: Option<i32>) {
        let _ = self.internal_tx.send(PaneInternalEvent::Exited {
            pane_id: self.pane_id,
            code,
        });
    }
}

/// Lock a shared scrollback buffer, recovering from poisoning.
pub fn lock_scrollback(
    scrollback: &Arc<Mutex<ScrollbackBuffer>>,
    pane_id: PaneId,
) -> MutexGuard<'_, ScrollbackBuffer> {
    match scrollback.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!(
                event = "daemon.pane.scrollback_lock_poisoned",
                pane_id = %pane_id,
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_protocol::ActivityKind;

    fn sinks() -> (OutputSinks, broadcast::Receiver<DaemonMessage>) {
        let (events_tx, events_rx) = broadcast::channel(16);
        let (internal_tx, _internal_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            OutputSinks {
                pane_id: PaneId::new(1),
                events_tx,
                scrollback: Arc::new(Mutex::new(ScrollbackBuffer::new(64))),
                last_activity: Arc::new(AtomicI64::new(0)),
                internal_tx,
            },
            events_rx,
        )
    }

    #[test]
    fn test_feed_updates_scrollback_and_broadcasts() {
        let (sinks, mut rx) = sinks();
        sinks.feed(b"hello");

        assert_eq!(
            lock_scrollback(&sinks.scrollback, sinks.pane_id).contents(),
            b"hello"
        );
        assert!(sinks.last_activity.load(Ordering::Relaxed) > 0);

        match rx.try_recv().unwrap() {
            DaemonMessage::Data { pane_id, data } => {
                assert_eq!(pane_id, PaneId::new(1));
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .unwrap();
                assert_eq!(decoded, b"hello");
            }
            other => panic!("expected Data, got {:?}", other),
        }
    }

    #[test]
    fn test_feed_without_receivers_ok() {
        let (sinks, rx) = sinks();
        drop(rx);
        // Must not panic with zero receivers
        sinks.feed(b"no one listening");
        assert_eq!(
            lock_scrollback(&sinks.scrollback, sinks.pane_id).len(),
            b"no one listening".len()
        );
    }

    #[test]
    fn test_activity_broadcasts_kind() {
        let (sinks, mut rx) = sinks();
        sinks.activity(ActivityKind::Done);
        match rx.try_recv().unwrap() {
            DaemonMessage::Activity { kind, .. } => assert_eq!(kind, ActivityKind::Done),
            other => panic!("expected Activity, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exited_sends_internal_event() {
        let (events_tx, _events_rx) = broadcast::channel(16);
        let (internal_tx, mut internal_rx) = tokio::sync::mpsc::unbounded_channel();
        let sinks = OutputSinks {
            pane_id: PaneId::new(7),
            events_tx,
            scrollback: Arc::new(Mutex::new(ScrollbackBuffer::new(8))),
            last_activity: Arc::new(AtomicI64::new(0)),
            internal_tx,
        };
        sinks.exited(Some(0));
        match internal_rx.recv().await.unwrap() {
            PaneInternalEvent::Exited { pane_id, code } => {
                assert_eq!(pane_id, PaneId::new(7));
                assert_eq!(code, Some(0));
            }
            other => panic!("expected Exited, got {:?}", other),
        }
    }
}

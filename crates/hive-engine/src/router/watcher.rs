//! File watcher for the triggers mailbox directory.
//!
//! A notify watcher on `triggers/` bridged into a tokio channel; the router
//! consumes the channel and applies its own debounce.

use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::EngineError;

pub struct TriggerWatcher {
    /// Underlying notify watcher. Must be kept alive.
    _watcher: RecommendedWatcher,
    receiver: mpsc::UnboundedReceiver<PathBuf>,
}

impl TriggerWatcher {
    /// Watch a triggers directory (created if missing).
    pub fn new(dir: &Path) -> Result<Self, EngineError> {
        std::fs::create_dir_all(dir)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    if !is_relevant_event(&event) {
                        return;
                    }
                    for path in event.paths {
                        if is_trigger_file(&path) {
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(e) => {
                    warn!(event = "engine.watcher.event_error", error = %e);
                }
            }
        })
        .map_err(|e| EngineError::ConnectionFailed(format!("watcher init: {}", e)))?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| EngineError::ConnectionFailed(format!("watch {}: {}", dir.display(), e)))?;

        debug!(event = "engine.watcher.watching", path = %dir.display());

        Ok(Self {
            _watcher: watcher,
            receiver: rx,
        })
    }

    /// Next changed trigger path. `None` when the watcher thread is gone.
    pub async fn recv(&mut self) -> Option<PathBuf> {
        self.receiver.recv().await
    }
}

fn is_relevant_event(event: &Event) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
}

fn is_trigger_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("txt")
}

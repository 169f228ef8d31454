//! Async streaming client for the daemon's Unix socket.
//!
//! One connection carries both request/response traffic (correlated by
//! request id) and the daemon's push events (`data`, `exit`, `activity`,
//! `spawned`), which are re-broadcast to engine subscribers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use hive_protocol::codec::{read_message, write_message};
use hive_protocol::{
    AgentMode, ClientMessage, DaemonMessage, PaneId, PaneInfo, SessionEntry,
};
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::errors::EngineError;

/// How long one request may wait for its response.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<DaemonMessage>>>>;

/// Async JSONL connection to the Hivemind daemon.
#[derive(Debug)]
pub struct DaemonClient {
    writer: Arc<tokio::sync::Mutex<tokio::net::unix::OwnedWriteHalf>>,
    pending: PendingMap,
    events_tx: broadcast::Sender<DaemonMessage>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl Drop for DaemonClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl DaemonClient {
    /// Connect to the daemon socket.
    pub async fn connect(socket_path: &Path) -> Result<Self, EngineError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| EngineError::ConnectionFailed(format!("{}: {}", socket_path.display(), e)))?;
        let (read_half, write_half) = stream.into_split();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, _) = broadcast::channel(1024);

        let reader_pending = Arc::clone(&pending);
        let reader_events = events_tx.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                match read_message::<_, DaemonMessage>(&mut reader).await {
                    Ok(Some(msg)) => {
                        let response_for = msg.response_id().map(str::to_string);
                        match response_for {
                            Some(id) => {
                                let sender = lock_pending(&reader_pending).remove(&id);
                                match sender {
                                    Some(tx) => {
                                        let _ = tx.send(msg);
                                    }
                                    None => {
                                        debug!(
                                            event = "engine.client.orphan_response",
                                            id = %id,
                                        );
                                    }
                                }
                            }
                            None => {
                                // Push event — deliver to subscribers.
                                let _ = reader_events.send(msg);
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(event = "engine.client.connection_closed");
                        break;
                    }
                    Err(e) => {
                        warn!(event = "engine.client.read_error", error = %e);
                        break;
                    }
                }
            }
            // Fail all in-flight requests by dropping their senders.
            lock_pending(&reader_pending).clear();
        });

        Ok(Self {
            writer: Arc::new(tokio::sync::Mutex::new(write_half)),
            pending,
            events_tx,
            reader_task,
        })
    }

    /// Connect with bounded retries — used while racing daemon startup.
    pub async fn connect_with_retry(
        socket_path: &Path,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self, EngineError> {
        let mut last_err =
            EngineError::ConnectionFailed(format!("{}: no attempts", socket_path.display()));
        for attempt in 0..attempts {
            match Self::connect(socket_path).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    debug!(
                        event = "engine.client.connect_retry",
                        attempt = attempt + 1,
                        attempts = attempts,
                        error = %e,
                    );
                    last_err = e;
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_err)
    }

    /// Subscribe to the daemon's push events.
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonMessage> {
        self.events_tx.subscribe()
    }

    /// Send one request and await its correlated response.
    pub async fn request(&self, msg: ClientMessage) -> Result<DaemonMessage, EngineError> {
        let id = msg.id().to_string();
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id.clone(), tx);

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = write_message(&mut *writer, &msg).await {
                lock_pending(&self.pending).remove(&id);
                return Err(e.into());
            }
        }

        let response = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(_)) => {
                return Err(EngineError::ConnectionFailed(
                    "daemon connection closed mid-request".to_string(),
                ));
            }
            Err(_) => {
                lock_pending(&self.pending).remove(&id);
                return Err(EngineError::Protocol(format!(
                    "request {} timed out",
                    id
                )));
            }
        };

        if let DaemonMessage::Error { code, message, .. } = response {
            return Err(EngineError::Daemon { code, message });
        }
        Ok(response)
    }

    fn request_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    // --- Typed helpers ---

    /// Spawn an agent child; returns the captured session id, if any.
    pub async fn spawn(
        &self,
        pane_id: PaneId,
        cwd: &str,
        mode: AgentMode,
        argv: Vec<String>,
        dry_run: bool,
    ) -> Result<Option<String>, EngineError> {
        let response = self
            .request(ClientMessage::Spawn {
                id: Self::request_id(),
                pane_id,
                cwd: cwd.to_string(),
                mode,
                argv,
                dry_run,
                env: HashMap::new(),
                rows: None,
                cols: None,
            })
            .await?;
        match response {
            DaemonMessage::Spawned { session_id, .. } => Ok(session_id),
            other => Err(unexpected("spawned", &other)),
        }
    }

    pub async fn write_bytes(&self, pane_id: PaneId, data: &[u8]) -> Result<(), EngineError> {
        let response = self
            .request(ClientMessage::Write {
                id: Self::request_id(),
                pane_id,
                data: base64::engine::general_purpose::STANDARD.encode(data),
            })
            .await?;
        match response {
            DaemonMessage::Ack { .. } => Ok(()),
            other => Err(unexpected("ack", &other)),
        }
    }

    pub async fn interrupt(&self, pane_id: PaneId) -> Result<(), EngineError> {
        let response = self
            .request(ClientMessage::Interrupt {
                id: Self::request_id(),
                pane_id,
            })
            .await?;
        match response {
            DaemonMessage::Ack { .. } => Ok(()),
            other => Err(unexpected("ack", &other)),
        }
    }

    pub async fn kill(&self, pane_id: PaneId, expected: bool) -> Result<(), EngineError> {
        let response = self
            .request(ClientMessage::Kill {
                id: Self::request_id(),
                pane_id,
                expected,
            })
            .await?;
        match response {
            DaemonMessage::Killed { .. } => Ok(()),
            other => Err(unexpected("killed", &other)),
        }
    }

    pub async fn list(&self) -> Result<Vec<PaneInfo>, EngineError> {
        let response = self
            .request(ClientMessage::List {
                id: Self::request_id(),
            })
            .await?;
        match response {
            DaemonMessage::List { panes, .. } => Ok(panes),
            other => Err(unexpected("list", &other)),
        }
    }

    /// Attach to a pane's output stream; returns the scrollback replay.
    pub async fn attach(&self, pane_id: PaneId) -> Result<Vec<u8>, EngineError> {
        let response = self
            .request(ClientMessage::Attach {
                id: Self::request_id(),
                pane_id,
            })
            .await?;
        match response {
            DaemonMessage::Attached { scrollback, .. } => Ok(base64::engine::general_purpose::STANDARD
                .decode(scrollback)
                .map_err(|e| EngineError::Protocol(format!("scrollback decode: {}", e)))?),
            other => Err(unexpected("attached", &other)),
        }
    }

    pub async fn get_session(
        &self,
        pane_id: Option<PaneId>,
    ) -> Result<Vec<SessionEntry>, EngineError> {
        let response = self
            .request(ClientMessage::GetSession {
                id: Self::request_id(),
                pane_id,
            })
            .await?;
        match response {
            DaemonMessage::Session { entries, .. } => Ok(entries),
            other => Err(unexpected("session", &other)),
        }
    }

    pub async fn save_session(&self) -> Result<(), EngineError> {
        let response = self
            .request(ClientMessage::SaveSession {
                id: Self::request_id(),
            })
            .await?;
        match response {
            DaemonMessage::Ack { .. } => Ok(()),
            other => Err(unexpected("ack", &other)),
        }
    }

    pub async fn ping(&self) -> Result<(), EngineError> {
        let response = self
            .request(ClientMessage::Ping {
                id: Self::request_id(),
            })
            .await?;
        match response {
            DaemonMessage::Pong { .. } => Ok(()),
            other => Err(unexpected("pong", &other)),
        }
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let response = self
            .request(ClientMessage::Shutdown {
                id: Self::request_id(),
            })
            .await?;
        match response {
            DaemonMessage::Ack { .. } => Ok(()),
            other => Err(unexpected("ack", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &DaemonMessage) -> EngineError {
    EngineError::Protocol(format!("expected {} response, got {:?}", wanted, got))
}

fn lock_pending(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<DaemonMessage>>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

//! Per-connection handler: dispatches client commands and forwards the
//! daemon event stream.

use std::sync::Arc;

use base64::Engine;
use hive_protocol::codec::{read_message, write_message};
use hive_protocol::{ClientMessage, DaemonMessage, ErrorCode};
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::DaemonError;
use crate::panes::{ClientId, PaneManager, SpawnRequest};

/// Handle one client connection for its lifetime.
pub async fn handle_connection(
    stream: UnixStream,
    manager: Arc<RwLock<PaneManager>>,
    events_tx: broadcast::Sender<DaemonMessage>,
    shutdown: CancellationToken,
) {
    let client_id = manager.write().await.next_client_id();
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let writer = Arc::new(Mutex::new(write_half));

    // Greeting
    {
        let mut w = writer.lock().await;
        if let Err(e) = write_message(
            &mut *w,
            &DaemonMessage::Connected {
                pid: std::process::id(),
            },
        )
        .await
        {
            debug!(event = "daemon.conn.greeting_failed", error = %e);
            return;
        }
    }

    debug!(event = "daemon.conn.accepted", client_id = client_id);

    // Event forwarding task. `data` frames go only to clients attached to
    // that pane; everything else goes to every connection.
    let forward_writer = Arc::clone(&writer);
    let forward_manager = Arc::clone(&manager);
    let mut events_rx = events_tx.subscribe();
    let forward_task = tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(msg) => {
                    if let DaemonMessage::Data { pane_id, .. } = &msg {
                        let attached = forward_manager
                            .read()
                            .await
                            .is_attached(*pane_id, client_id);
                        if !attached {
                            continue;
                        }
                    }
                    let mut w = forward_writer.lock().await;
                    if write_message(&mut *w, &msg).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Slow consumer — drop lagged frames and continue.
                    warn!(
                        event = "daemon.conn.events_lagged",
                        client_id = client_id,
                        skipped = skipped,
                    );
                }
            }
        }
    });

    // Request loop.
    loop {
        tokio::select! {
            result = read_message::<_, ClientMessage>(&mut reader) => {
                match result {
                    Ok(Some(request)) => {
                        let response =
                            dispatch(request, &manager, client_id, &shutdown).await;
                        let mut w = writer.lock().await;
                        if let Err(e) = write_message(&mut *w, &response).await {
                            debug!(
                                event = "daemon.conn.write_failed",
                                client_id = client_id,
                                error = %e,
                            );
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(event = "daemon.conn.closed", client_id = client_id);
                        break;
                    }
                    Err(e) => {
                        warn!(
                            event = "daemon.conn.read_error",
                            client_id = client_id,
                            error = %e,
                        );
                        break;
                    }
                }
            }
            _ = shutdown.cancelled() => {
                debug!(event = "daemon.conn.shutdown", client_id = client_id);
                break;
            }
        }
    }

    forward_task.abort();
    manager.write().await.detach_client_from_all(client_id);
}

/// Dispatch a single request to the pane manager and build the response.
async fn dispatch(
    request: ClientMessage,
    manager: &Arc<RwLock<PaneManager>>,
    client_id: ClientId,
    shutdown: &CancellationToken,
) -> DaemonMessage {
    let request_id = request.id().to_string();

    let result: Result<DaemonMessage, DaemonError> = match request {
        ClientMessage::Spawn {
            pane_id,
            cwd,
            mode,
            argv,
            dry_run,
            env,
            rows,
            cols,
            ..
        } => {
            let req = SpawnRequest {
                pane_id,
                cwd,
                mode,
                argv,
                dry_run,
                env: env.into_iter().collect(),
                rows,
                cols,
            };
            manager
                .write()
                .await
                .spawn(req)
                .map(|info| DaemonMessage::Spawned {
                    id: Some(request_id.clone()),
                    pane_id: info.pane_id,
                    mode: info.mode,
                    pid: info.pid,
                    session_id: info.session_id,
                })
        }

        ClientMessage::Write { pane_id, data, .. } => {
            let decode = base64::engine::general_purpose::STANDARD
                .decode(&data)
                .map_err(DaemonError::Base64Decode);
            match decode {
                Ok(bytes) => manager
                    .read()
                    .await
                    .write(pane_id, &bytes)
                    .map(|()| DaemonMessage::Ack {
                        id: request_id.clone(),
                    }),
                Err(e) => Err(e),
            }
        }

        ClientMessage::Resize {
            pane_id, rows, cols, ..
        } => manager
            .write()
            .await
            .resize(pane_id, rows, cols)
            .map(|()| DaemonMessage::Ack {
                id: request_id.clone(),
            }),

        ClientMessage::Kill {
            pane_id, expected, ..
        } => manager
            .write()
            .await
            .kill(pane_id, expected)
            .map(|()| DaemonMessage::Killed {
                id: request_id.clone(),
                pane_id,
            }),

        ClientMessage::Interrupt { pane_id, .. } => manager
            .read()
            .await
            .interrupt(pane_id)
            .map(|()| DaemonMessage::Ack {
                id: request_id.clone(),
            }),

        ClientMessage::List { .. } => Ok(DaemonMessage::List {
            id: request_id.clone(),
            panes: manager.read().await.list(),
        }),

        ClientMessage::Attach { pane_id, .. } => manager
            .write()
            .await
            .attach(pane_id, client_id)
            .map(|scrollback| DaemonMessage::Attached {
                id: request_id.clone(),
                pane_id,
                scrollback: base64::engine::general_purpose::STANDARD.encode(scrollback),
            }),

        ClientMessage::GetSession { pane_id, .. } => Ok(DaemonMessage::Session {
            id: request_id.clone(),
            entries: manager.read().await.session_entries(pane_id),
        }),

        ClientMessage::SaveSession { .. } => {
            manager.read().await.persist();
            Ok(DaemonMessage::Ack {
                id: request_id.clone(),
            })
        }

        ClientMessage::ClearSession { pane_id, .. } => {
            manager.write().await.clear_session(pane_id);
            Ok(DaemonMessage::Ack {
                id: request_id.clone(),
            })
        }

        ClientMessage::Ping { .. } => Ok(DaemonMessage::Pong {
            id: request_id.clone(),
        }),

        ClientMessage::Shutdown { .. } => {
            shutdown.cancel();
            Ok(DaemonMessage::Ack {
                id: request_id.clone(),
            })
        }

        _ => Err(DaemonError::ProtocolError("unknown request type".into())),
    };

    result.unwrap_or_else(|e| DaemonMessage::Error {
        id: request_id,
        code: ErrorCode::from_code(e.error_code()),
        message: e.to_string(),
    })
}

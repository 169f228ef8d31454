pub mod connection;
pub mod shutdown;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::DaemonError;
use crate::events::PaneInternalEvent;
use crate::panes::PaneManager;
use crate::pid;
use crate::types::DaemonConfig;

/// Run the daemon server.
///
/// This is the main entrypoint called by `hive-daemon` / `hivemind daemon`. It:
/// 1. Checks for an existing daemon (PID file)
/// 2. Writes a PID file
/// 3. Binds the workspace Unix socket
/// 4. Accepts client connections in a loop
/// 5. Routes child-exit and session-capture notifications to the pane manager
/// 6. Snapshots session state periodically while any pane is alive
/// 7. Handles graceful shutdown on SIGTERM/SIGINT or the IPC shutdown command
pub async fn run_server(config: DaemonConfig) -> Result<(), DaemonError> {
    let pid_path = config.pid_path.clone();
    let socket_path = config.socket_path.clone();
    let snapshot_interval = Duration::from_secs(config.snapshot_interval_secs);
    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_secs);

    // Check if another daemon is already running
    if let Some(existing_pid) = pid::check_daemon_running(&pid_path) {
        return Err(DaemonError::AlreadyRunning(existing_pid));
    }

    pid::write_pid_file(&pid_path)?;

    // Clean up stale socket file
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }

    // Ensure socket directory exists
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(&socket_path)?;

    info!(
        event = "daemon.server.started",
        pid = std::process::id(),
        socket = %socket_path.display(),
    );

    // Broadcast channel for daemon events (data/exit/activity/spawned).
    let (events_tx, _) = broadcast::channel(1024);
    // Channel for child-exit / session-capture notifications from backend tasks.
    let (internal_tx, mut internal_rx) = tokio::sync::mpsc::unbounded_channel();

    let manager = Arc::new(RwLock::new(PaneManager::new(
        config,
        events_tx.clone(),
        internal_tx,
    )));
    let shutdown = CancellationToken::new();

    // Spawn signal handler
    let signal_shutdown = shutdown.clone();
    tokio::spawn(shutdown::wait_for_shutdown_signal(signal_shutdown));

    // Periodic session-state snapshot while panes are alive.
    let snapshot_manager = Arc::clone(&manager);
    let snapshot_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(snapshot_interval);
        interval.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mgr = snapshot_manager.read().await;
                    if mgr.any_alive() {
                        mgr.persist();
                    }
                }
                _ = snapshot_shutdown.cancelled() => break,
            }
        }
    });

    // Accept loop
    loop {
        tokio::select! {
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        tokio::spawn(connection::handle_connection(
                            stream,
                            Arc::clone(&manager),
                            events_tx.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        error!(
                            event = "daemon.server.accept_failed",
                            error = %e,
                        );
                    }
                }
            }
            Some(event) = internal_rx.recv() => {
                let mut mgr = manager.write().await;
                match event {
                    PaneInternalEvent::Exited { pane_id, code } => {
                        mgr.handle_exit(pane_id, code);
                    }
                    PaneInternalEvent::SessionCaptured { pane_id, session_id } => {
                        mgr.capture_session(pane_id, session_id);
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!(event = "daemon.server.shutdown_started");
                break;
            }
        }
    }

    // Graceful shutdown: kill children as expected exits, then drain their
    // exit notifications (bounded by shutdown_timeout) so the final
    // session-state snapshot records them as not alive.
    manager.write().await.kill_all();
    let deadline = tokio::time::Instant::now() + shutdown_timeout;
    while manager.read().await.any_alive() {
        match tokio::time::timeout_at(deadline, internal_rx.recv()).await {
            Ok(Some(PaneInternalEvent::Exited { pane_id, code })) => {
                manager.write().await.handle_exit(pane_id, code);
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                warn!(event = "daemon.server.shutdown_drain_timeout");
                break;
            }
        }
    }
    manager.read().await.persist();

    cleanup(&pid_path, &socket_path);

    info!(event = "daemon.server.shutdown_completed");

    Ok(())
}

/// Clean up PID file and socket file on shutdown.
fn cleanup(pid_path: &Path, socket_path: &Path) {
    if let Err(e) = pid::remove_pid_file(pid_path) {
        error!(
            event = "daemon.server.pid_cleanup_failed",
            error = %e,
        );
    }
    if socket_path.exists()
        && let Err(e) = std::fs::remove_file(socket_path)
    {
        error!(
            event = "daemon.server.socket_cleanup_failed",
            error = %e,
        );
    }
}

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl-C).
///
/// When the signal is received, cancels the provided token to notify
/// all tasks to drain gracefully.
pub async fn wait_for_shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(
                    event = "daemon.server.signal_register_failed",
                    error = %e,
                    "SIGTERM handler unavailable; only Ctrl-C and the IPC \
                     shutdown command will stop this daemon.",
                );
                ctrl_c.await.ok();
                info!(event = "daemon.server.signal_received", signal = "SIGINT");
                token.cancel();
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => {
                info!(event = "daemon.server.signal_received", signal = "SIGINT");
            }
            _ = sigterm.recv() => {
                info!(event = "daemon.server.signal_received", signal = "SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!(event = "daemon.server.signal_received", signal = "SIGINT");
    }

    token.cancel();
}

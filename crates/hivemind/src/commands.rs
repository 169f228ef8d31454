pub mod daemon {
    use hive_paths::HivePaths;
    use tracing::error;

    /// Run the terminal daemon in the foreground until signaled.
    pub fn run(paths: &HivePaths) -> Result<(), Box<dyn std::error::Error>> {
        hive_engine::init_logging(paths)?;

        let config = hive_daemon::load_daemon_config(paths)?;
        eprintln!(
            "Starting daemon in foreground (PID: {}, socket: {})...",
            std::process::id(),
            config.socket_path.display()
        );

        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            hive_daemon::run_server(config).await.map_err(|e| {
                error!(event = "cli.daemon.server_failed", error = %e);
                e
            })
        })?;
        Ok(())
    }
}

pub mod host {
    use hive_engine::{Engine, EngineOptions};
    use hive_paths::HivePaths;
    use tracing::info;

    /// The hosting process: spawn the roster and run the engine until
    /// SIGINT/SIGTERM.
    pub fn run(paths: &HivePaths, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
        hive_engine::init_logging(paths)?;

        let config = hive_engine::load_config(paths)?;
        if config.agents.is_empty() {
            return Err("no [[agents]] configured in hivemind.toml".into());
        }

        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let engine = Engine::start(
                paths.clone(),
                config,
                EngineOptions {
                    dry_run,
                    ..EngineOptions::default()
                },
            )
            .await?;

            eprintln!("hivemind engine running — Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            info!(event = "cli.host.shutdown_signal");
            engine.shutdown();
            Ok::<(), Box<dyn std::error::Error>>(())
        })?;
        Ok(())
    }
}

pub mod send {
    use hive_engine::router::sequences::SequenceStore;
    use hive_paths::HivePaths;

    /// Write a correctly-headed message into the recipient's mailbox,
    /// allocating the next outbound sequence for the sender.
    pub fn run(
        paths: &HivePaths,
        recipient: &str,
        text: &str,
        from: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut store = SequenceStore::load(&paths.message_state_file())?;
        let seq = store.next_outbound(from)?;

        let header_role = from.to_uppercase();
        let message = format!("({header_role} #{seq}): {text}\n");

        std::fs::create_dir_all(paths.triggers_dir())?;
        let trigger = paths.trigger_file(recipient);
        std::fs::write(&trigger, &message)?;

        println!(
            "queued #{seq} from {from} to {recipient} ({})",
            trigger.display()
        );
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_send_writes_header_and_bumps_outbound() {
            let dir = tempfile::tempdir().unwrap();
            let paths = HivePaths::from_dir(dir.path().to_path_buf());

            run(&paths, "worker-a", "do X", "architect").unwrap();
            let content =
                std::fs::read_to_string(paths.trigger_file("worker-a")).unwrap();
            assert_eq!(content, "(ARCHITECT #1): do X\n");

            run(&paths, "worker-a", "do Y", "architect").unwrap();
            let content =
                std::fs::read_to_string(paths.trigger_file("worker-a")).unwrap();
            assert_eq!(content, "(ARCHITECT #2): do Y\n");
        }
    }
}

pub mod health {
    use hive_paths::HivePaths;
    use hive_protocol::{ClientMessage, DaemonMessage, IpcConnection};

    /// Print the pane roster as the daemon sees it.
    pub fn run(paths: &HivePaths) -> Result<(), Box<dyn std::error::Error>> {
        let mut conn = IpcConnection::connect(&paths.daemon_socket())?;
        let response = conn.send(&ClientMessage::List {
            id: "cli-health".to_string(),
        })?;

        let DaemonMessage::List { panes, .. } = response else {
            return Err("unexpected daemon response".into());
        };

        if panes.is_empty() {
            println!("no panes");
            return Ok(());
        }

        println!(
            "{:<6} {:<12} {:<22} {:<8} {}",
            "PANE", "MODE", "STATUS", "PID", "LAST ACTIVITY"
        );
        for pane in panes {
            println!(
                "{:<6} {:<12} {:<22} {:<8} {}",
                pane.pane_id.to_string(),
                pane.mode.to_string(),
                pane.status.to_string(),
                pane.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
                pane.last_activity.as_deref().unwrap_or("-"),
            );
        }
        Ok(())
    }
}

pub mod ping {
    use hive_paths::HivePaths;
    use hive_protocol::{ClientMessage, DaemonMessage, IpcConnection};
    use std::time::Duration;

    /// Daemon liveness round-trip.
    pub fn run(paths: &HivePaths) -> Result<(), Box<dyn std::error::Error>> {
        let mut conn = IpcConnection::connect(&paths.daemon_socket())?;
        conn.set_read_timeout(Some(Duration::from_secs(2)))?;

        let response = conn.send(&ClientMessage::Ping {
            id: "cli-ping".to_string(),
        })?;
        match response {
            DaemonMessage::Pong { .. } => {
                println!("daemon is up");
                Ok(())
            }
            other => Err(format!("unexpected response: {:?}", other).into()),
        }
    }
}

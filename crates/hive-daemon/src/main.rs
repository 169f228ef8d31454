use tracing::{error, info};

fn main() {
    init_logging();
    info!(event = "daemon.start_started");

    let exit_code = match run() {
        Ok(()) => {
            info!(event = "daemon.start_completed");
            0
        }
        Err(e) => {
            error!(event = "daemon.start_failed", error = %e);
            eprintln!("hive-daemon: {}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    eprintln!(
        "Starting daemon in foreground (PID: {})...",
        std::process::id()
    );

    let paths = hive_paths::HivePaths::resolve()?;

    let config = hive_daemon::load_daemon_config(&paths).map_err(|e| {
        error!(event = "daemon.config_load_failed", error = %e);
        e
    })?;

    let rt = tokio::runtime::Runtime::new().map_err(|e| {
        error!(event = "daemon.runtime_init_failed", error = %e);
        e
    })?;

    rt.block_on(async {
        hive_daemon::run_server(config).await.map_err(|e| {
            error!(event = "daemon.server_failed", error = %e);
            e
        })
    })?;

    Ok(())
}

/// Stderr-only tracing for the standalone daemon binary. The host process
/// (`hivemind run`) configures the file-backed subscriber instead.
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

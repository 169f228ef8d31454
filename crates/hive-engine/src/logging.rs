//! Tracing initialization for the hosting process.
//!
//! Two layers: a JSON layer appending to `workspace/logs/app.log`, and an
//! env-filtered plain layer on stderr. Run with `RUST_LOG=debug` to surface
//! diagnostic-level records.

use hive_paths::HivePaths;

use crate::errors::EngineError;

/// Initialize the global subscriber. Call once, early in the host.
///
/// Fails when the log directory cannot be created or the log file cannot be
/// opened — per the engine contract, an unwritable workspace is a fatal
/// initialization error.
pub fn init_logging(paths: &HivePaths) -> Result<(), EngineError> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    std::fs::create_dir_all(paths.logs_dir())?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.app_log_file())?;

    let file_layer = fmt::layer()
        .json()
        .with_writer(std::sync::Mutex::new(file))
        .with_target(false);

    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_creates_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HivePaths::from_dir(dir.path().to_path_buf());

        // The global subscriber can only be installed once per process;
        // other tests may have installed one already, so only assert on
        // the filesystem side effects.
        let _ = init_logging(&paths);
        assert!(paths.logs_dir().is_dir());
        assert!(paths.app_log_file().exists());
    }
}

use hive_paths::HivePaths;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Daemon-specific configuration.
///
/// Read from the `[daemon]` section of `hivemind.toml` in the workspace root.
/// The daemon reads this itself; hive-engine does not carry it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path to the Unix domain socket.
    /// Default: `<workspace>/daemon.sock`
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Path to the PID file.
    /// Default: `<workspace>/daemon.pid`
    #[serde(default = "default_pid_path")]
    pub pid_path: PathBuf,

    /// Path to the persisted session-state file.
    /// Default: `<workspace>/session-state.json`
    #[serde(default = "default_session_state_path")]
    pub session_state_path: PathBuf,

    /// Per-pane scrollback ring buffer size in bytes.
    /// Default: 262144 (256 KB)
    #[serde(default = "default_scrollback_buffer_size")]
    pub scrollback_buffer_size: usize,

    /// How many trailing scrollback bytes are persisted per pane.
    /// Default: 8192
    #[serde(default = "default_persisted_scrollback_bytes")]
    pub persisted_scrollback_bytes: usize,

    /// Session-state snapshot cadence in seconds while any pane is alive.
    /// Default: 30
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    /// Time in seconds to wait for children to exit during shutdown.
    /// Default: 5
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Default PTY dimensions for spawns that don't specify them.
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
}

impl DaemonConfig {
    /// Validate configuration values.
    ///
    /// Called after loading config to catch misconfiguration early.
    pub fn validate(&self) -> Result<(), crate::errors::DaemonError> {
        if self.scrollback_buffer_size == 0 {
            return Err(crate::errors::DaemonError::ConfigInvalid(
                "scrollback_buffer_size must be > 0".to_string(),
            ));
        }
        if self.persisted_scrollback_bytes > self.scrollback_buffer_size {
            return Err(crate::errors::DaemonError::ConfigInvalid(
                "persisted_scrollback_bytes must be <= scrollback_buffer_size".to_string(),
            ));
        }
        if self.snapshot_interval_secs == 0 {
            return Err(crate::errors::DaemonError::ConfigInvalid(
                "snapshot_interval_secs must be > 0".to_string(),
            ));
        }
        if self.shutdown_timeout_secs == 0 {
            return Err(crate::errors::DaemonError::ConfigInvalid(
                "shutdown_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.default_rows == 0 || self.default_cols == 0 {
            return Err(crate::errors::DaemonError::ConfigInvalid(
                "default_rows/default_cols must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Config with all paths rooted at an explicit workspace dir. Use in tests
    /// and when the host passes a workspace explicitly.
    pub fn for_workspace(paths: &HivePaths) -> Self {
        Self {
            socket_path: paths.daemon_socket(),
            pid_path: paths.daemon_pid_file(),
            session_state_path: paths.session_state_file(),
            ..Self::default()
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            pid_path: default_pid_path(),
            session_state_path: default_session_state_path(),
            scrollback_buffer_size: default_scrollback_buffer_size(),
            persisted_scrollback_bytes: default_persisted_scrollback_bytes(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            default_rows: default_rows(),
            default_cols: default_cols(),
        }
    }
}

fn fallback_paths() -> HivePaths {
    HivePaths::resolve().unwrap_or_else(|e| {
        tracing::warn!(
            event = "daemon.config.workspace_fallback",
            error = %e,
            fallback = "/tmp/.hivemind",
        );
        HivePaths::from_dir(PathBuf::from("/tmp/.hivemind"))
    })
}

fn default_socket_path() -> PathBuf {
    fallback_paths().daemon_socket()
}

fn default_pid_path() -> PathBuf {
    fallback_paths().daemon_pid_file()
}

fn default_session_state_path() -> PathBuf {
    fallback_paths().session_state_file()
}

fn default_scrollback_buffer_size() -> usize {
    262_144
}

fn default_persisted_scrollback_bytes() -> usize {
    8_192
}

fn default_snapshot_interval_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

/// Wrapper for deserializing the `[daemon]` section from `hivemind.toml`.
///
/// This struct mirrors just enough of the file structure to extract the
/// `[daemon]` section; the engine's sections are parsed by hive-engine.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    daemon: DaemonConfig,
}

/// Load daemon configuration from the workspace `hivemind.toml`.
///
/// Falls back to defaults if the file doesn't exist or the section is missing.
pub fn load_daemon_config(paths: &HivePaths) -> Result<DaemonConfig, crate::errors::DaemonError> {
    let config_path = paths.config_file();

    let mut config = match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
            Ok(file) => file.daemon,
            Err(e) => {
                tracing::warn!(
                    event = "daemon.config.parse_failed",
                    path = %config_path.display(),
                    error = %e,
                );
                DaemonConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => DaemonConfig::default(),
        Err(e) => {
            tracing::warn!(
                event = "daemon.config.read_failed",
                path = %config_path.display(),
                error = %e,
            );
            DaemonConfig::default()
        }
    };

    // Paths not overridden in the file always follow the resolved workspace.
    let defaults = DaemonConfig::default();
    if config.socket_path == defaults.socket_path {
        config.socket_path = paths.daemon_socket();
    }
    if config.pid_path == defaults.pid_path {
        config.pid_path = paths.daemon_pid_file();
    }
    if config.session_state_path == defaults.session_state_path {
        config.session_state_path = paths.session_state_file();
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_config_defaults() {
        let config = DaemonConfig::default();
        assert!(config.socket_path.ends_with("daemon.sock"));
        assert_eq!(config.scrollback_buffer_size, 262_144);
        assert_eq!(config.persisted_scrollback_bytes, 8_192);
        assert_eq!(config.snapshot_interval_secs, 30);
        assert_eq!(config.shutdown_timeout_secs, 5);
        assert_eq!(config.default_rows, 24);
        assert_eq!(config.default_cols, 80);
    }

    #[test]
    fn test_daemon_config_serde_roundtrip() {
        let config = DaemonConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: DaemonConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.scrollback_buffer_size, config.scrollback_buffer_size);
        assert_eq!(parsed.snapshot_interval_secs, config.snapshot_interval_secs);
        assert_eq!(parsed.shutdown_timeout_secs, config.shutdown_timeout_secs);
    }

    #[test]
    fn test_for_workspace_roots_paths() {
        let paths = HivePaths::from_dir(PathBuf::from("/work/hive"));
        let config = DaemonConfig::for_workspace(&paths);
        assert_eq!(config.socket_path, PathBuf::from("/work/hive/daemon.sock"));
        assert_eq!(config.pid_path, PathBuf::from("/work/hive/daemon.pid"));
        assert_eq!(
            config.session_state_path,
            PathBuf::from("/work/hive/session-state.json")
        );
    }

    #[test]
    fn test_load_daemon_config_from_toml() {
        let toml = r#"
[daemon]
scrollback_buffer_size = 1024
shutdown_timeout_secs = 10
"#;
        let file: ConfigFile = toml::from_str(toml).unwrap();
        assert_eq!(file.daemon.scrollback_buffer_size, 1024);
        assert_eq!(file.daemon.shutdown_timeout_secs, 10);
        // Defaults for unset fields
        assert_eq!(file.daemon.snapshot_interval_secs, 30);
    }

    #[test]
    fn test_load_daemon_config_missing_section() {
        let toml = r#"
[engine]
idle_threshold_ms = 500
"#;
        let file: ConfigFile = toml::from_str(toml).unwrap();
        assert_eq!(file.daemon.scrollback_buffer_size, 262_144);
        assert_eq!(file.daemon.shutdown_timeout_secs, 5);
    }

    #[test]
    fn test_validate_defaults_ok() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_scrollback_fails() {
        let mut config = DaemonConfig::default();
        config.scrollback_buffer_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("scrollback_buffer_size"));
    }

    #[test]
    fn test_validate_persisted_larger_than_buffer_fails() {
        let mut config = DaemonConfig::default();
        config.persisted_scrollback_bytes = config.scrollback_buffer_size + 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("persisted_scrollback_bytes"));
    }

    #[test]
    fn test_validate_zero_snapshot_interval_fails() {
        let mut config = DaemonConfig::default();
        config.snapshot_interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("snapshot_interval_secs"));
    }

    #[test]
    fn test_validate_zero_dimensions_fail() {
        let mut config = DaemonConfig::default();
        config.default_rows = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HivePaths::from_dir(dir.path().to_path_buf());
        let config = load_daemon_config(&paths).unwrap();
        assert_eq!(config.socket_path, paths.daemon_socket());
        assert_eq!(config.scrollback_buffer_size, 262_144);
    }

    #[test]
    fn test_load_config_reads_daemon_section() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HivePaths::from_dir(dir.path().to_path_buf());
        std::fs::write(
            paths.config_file(),
            "[daemon]\nscrollback_buffer_size = 2048\n",
        )
        .unwrap();
        let config = load_daemon_config(&paths).unwrap();
        assert_eq!(config.scrollback_buffer_size, 2048);
        assert_eq!(config.pid_path, paths.daemon_pid_file());
    }
}

use std::io;

/// All error types for the hive-daemon crate.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon not running")]
    NotRunning,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("pane not found: {0}")]
    NotFound(hive_protocol::PaneId),

    #[error("pane already spawned: {0}")]
    AlreadySpawned(hive_protocol::PaneId),

    #[error("pane not alive: {0}")]
    NotAlive(hive_protocol::PaneId),

    #[error("PTY error: {0}")]
    PtyError(String),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    #[error("daemon already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("shutdown timeout exceeded")]
    ShutdownTimeout,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

impl DaemonError {
    /// Error code string for the IPC protocol.
    pub fn error_code(&self) -> &'static str {
        match self {
            DaemonError::NotRunning => "daemon_not_running",
            DaemonError::ConnectionFailed(_) => "connection_failed",
            DaemonError::ProtocolError(_) => "protocol_error",
            DaemonError::NotFound(_) => "not_found",
            DaemonError::AlreadySpawned(_) => "already_spawned",
            DaemonError::NotAlive(_) => "not_alive",
            DaemonError::PtyError(_) => "pty_error",
            DaemonError::SpawnFailed(_) => "spawn_failed",
            DaemonError::ConfigInvalid(_) => "config_invalid",
            DaemonError::AlreadyRunning(_) => "daemon_already_running",
            DaemonError::ShutdownTimeout => "shutdown_timeout",
            DaemonError::Io(_) => "io_error",
            DaemonError::Serde(_) => "serialization_error",
            DaemonError::Base64Decode(_) => "base64_decode_error",
        }
    }

    /// Whether this error is a structural pre-condition violation that the
    /// caller must not retry.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            DaemonError::NotFound(_)
                | DaemonError::AlreadySpawned(_)
                | DaemonError::NotAlive(_)
                | DaemonError::AlreadyRunning(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_protocol::PaneId;

    #[test]
    fn test_error_display() {
        let err = DaemonError::NotFound(PaneId::new(3));
        assert_eq!(err.to_string(), "pane not found: 3");
        assert_eq!(err.error_code(), "not_found");
        assert!(err.is_precondition());
    }

    #[test]
    fn test_error_codes() {
        let cases: Vec<(DaemonError, &str)> = vec![
            (DaemonError::NotRunning, "daemon_not_running"),
            (
                DaemonError::ConnectionFailed("refused".to_string()),
                "connection_failed",
            ),
            (
                DaemonError::ProtocolError("bad json".to_string()),
                "protocol_error",
            ),
            (DaemonError::NotFound(PaneId::new(1)), "not_found"),
            (DaemonError::AlreadySpawned(PaneId::new(1)), "already_spawned"),
            (DaemonError::NotAlive(PaneId::new(1)), "not_alive"),
            (DaemonError::PtyError("alloc failed".to_string()), "pty_error"),
            (
                DaemonError::SpawnFailed("missing binary".to_string()),
                "spawn_failed",
            ),
            (DaemonError::AlreadyRunning(1234), "daemon_already_running"),
            (DaemonError::ShutdownTimeout, "shutdown_timeout"),
        ];

        for (err, expected_code) in cases {
            assert_eq!(err.error_code(), expected_code);
        }
    }

    #[test]
    fn test_precondition_classification() {
        assert!(DaemonError::NotFound(PaneId::new(1)).is_precondition());
        assert!(DaemonError::AlreadySpawned(PaneId::new(1)).is_precondition());
        assert!(DaemonError::NotAlive(PaneId::new(1)).is_precondition());
        assert!(DaemonError::AlreadyRunning(123).is_precondition());

        assert!(!DaemonError::NotRunning.is_precondition());
        assert!(!DaemonError::PtyError("x".to_string()).is_precondition());
        assert!(!DaemonError::ShutdownTimeout.is_precondition());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let daemon_err: DaemonError = io_err.into();
        assert_eq!(daemon_err.error_code(), "io_error");
        assert!(!daemon_err.is_precondition());
    }
}

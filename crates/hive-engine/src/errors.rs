use std::io;

use hive_protocol::{PaneId, Role};

/// All error types for the hive-engine crate.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workspace path error: {0}")]
    Path(#[from] hive_paths::PathError),

    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    #[error("unknown recipient: {0}")]
    UnknownRecipient(Role),

    #[error("no agent in pane {0}")]
    UnknownPane(PaneId),

    #[error("daemon connection failed: {0}")]
    ConnectionFailed(String),

    #[error("daemon error [{code}]: {message}")]
    Daemon {
        code: hive_protocol::ErrorCode,
        message: String,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<hive_protocol::codec::CodecError> for EngineError {
    fn from(e: hive_protocol::codec::CodecError) -> Self {
        match e {
            hive_protocol::codec::CodecError::Io(io) => EngineError::Io(io),
            hive_protocol::codec::CodecError::Protocol(msg) => EngineError::Protocol(msg),
        }
    }
}

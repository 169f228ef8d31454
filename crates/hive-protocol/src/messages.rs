use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{ActivityKind, AgentMode, PaneId, PaneInfo};

/// Error codes returned by the daemon in error responses.
///
/// Maps 1:1 with `DaemonError` variants on the server side. Unknown codes
/// from future daemon versions deserialize to `Unknown` via `#[serde(other)]`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadySpawned,
    NotAlive,
    PtyError,
    SpawnFailed,
    ConfigInvalid,
    DaemonAlreadyRunning,
    DaemonNotRunning,
    ConnectionFailed,
    ProtocolError,
    IoError,
    SerializationError,
    Base64DecodeError,
    ShutdownTimeout,
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    /// Convert a string error code (from `DaemonError::error_code()`) to an `ErrorCode`.
    pub fn from_code(code: &str) -> Self {
        serde_json::from_value(serde_json::Value::String(code.to_string()))
            .unwrap_or(ErrorCode::Unknown)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::NotFound => write!(f, "not_found"),
            ErrorCode::AlreadySpawned => write!(f, "already_spawned"),
            ErrorCode::NotAlive => write!(f, "not_alive"),
            ErrorCode::PtyError => write!(f, "pty_error"),
            ErrorCode::SpawnFailed => write!(f, "spawn_failed"),
            ErrorCode::ConfigInvalid => write!(f, "config_invalid"),
            ErrorCode::DaemonAlreadyRunning => write!(f, "daemon_already_running"),
            ErrorCode::DaemonNotRunning => write!(f, "daemon_not_running"),
            ErrorCode::ConnectionFailed => write!(f, "connection_failed"),
            ErrorCode::ProtocolError => write!(f, "protocol_error"),
            ErrorCode::IoError => write!(f, "io_error"),
            ErrorCode::SerializationError => write!(f, "serialization_error"),
            ErrorCode::Base64DecodeError => write!(f, "base64_decode_error"),
            ErrorCode::ShutdownTimeout => write!(f, "shutdown_timeout"),
            ErrorCode::Unknown => write!(f, "unknown"),
        }
    }
}

/// Client -> Daemon request messages.
///
/// Each variant maps to a JSONL message with `"type"` as the tag field.
/// All requests carry an `id` field for response correlation.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Spawn an agent child in a pane.
    ///
    /// The daemon does NOT decide what to run — the caller supplies the
    /// full argv. `dry_run` creates a mock terminal with no child process.
    #[serde(rename = "spawn")]
    Spawn {
        id: String,
        pane_id: PaneId,
        cwd: String,
        mode: AgentMode,
        argv: Vec<String>,
        #[serde(default)]
        dry_run: bool,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
    },

    /// Write bytes to the child's stdin (PTY input or exec-child stdin).
    #[serde(rename = "write")]
    Write {
        id: String,
        pane_id: PaneId,
        /// Base64-encoded bytes.
        data: String,
    },

    #[serde(rename = "resize")]
    Resize {
        id: String,
        pane_id: PaneId,
        rows: u16,
        cols: u16,
    },

    /// Kill the child. `expected` suppresses recovery for the resulting
    /// exit event.
    #[serde(rename = "kill")]
    Kill {
        id: String,
        pane_id: PaneId,
        #[serde(default)]
        expected: bool,
    },

    /// Write 0x03 to PTY stdin. Documented no-op for exec panes.
    #[serde(rename = "interrupt")]
    Interrupt { id: String, pane_id: PaneId },

    #[serde(rename = "list")]
    List { id: String },

    /// Subscribe this connection to `data` events for a pane; the response
    /// replays the scrollback buffer.
    #[serde(rename = "attach")]
    Attach { id: String, pane_id: PaneId },

    /// Fetch persisted session state (all panes, or one).
    #[serde(rename = "get_session")]
    GetSession {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pane_id: Option<PaneId>,
    },

    /// Force a session-state snapshot to disk now.
    #[serde(rename = "save_session")]
    SaveSession { id: String },

    /// Drop persisted session state (all panes, or one).
    #[serde(rename = "clear_session")]
    ClearSession {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pane_id: Option<PaneId>,
    },

    #[serde(rename = "ping")]
    Ping { id: String },

    #[serde(rename = "shutdown")]
    Shutdown { id: String },
}

impl ClientMessage {
    /// Extract the request ID from any client message.
    pub fn id(&self) -> &str {
        match self {
            ClientMessage::Spawn { id, .. }
            | ClientMessage::Write { id, .. }
            | ClientMessage::Resize { id, .. }
            | ClientMessage::Kill { id, .. }
            | ClientMessage::Interrupt { id, .. }
            | ClientMessage::List { id, .. }
            | ClientMessage::Attach { id, .. }
            | ClientMessage::GetSession { id, .. }
            | ClientMessage::SaveSession { id, .. }
            | ClientMessage::ClearSession { id, .. }
            | ClientMessage::Ping { id, .. }
            | ClientMessage::Shutdown { id, .. } => id,
        }
    }
}

/// One pane's persisted session entry as exposed over IPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub pane_id: PaneId,
    pub cwd: String,
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Daemon -> Client response and streaming messages.
///
/// Response messages echo the request `id`. Streaming messages have no `id`
/// and are pushed to every connected (and, for `data`, attached) client.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonMessage {
    /// Greeting pushed once per connection.
    #[serde(rename = "connected")]
    Connected { pid: u32 },

    /// Response to `spawn` (with `id`) and broadcast notification (without).
    #[serde(rename = "spawned")]
    Spawned {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        pane_id: PaneId,
        mode: AgentMode,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Raw output chunk. No `id` — pushed after attach.
    #[serde(rename = "data")]
    Data {
        pane_id: PaneId,
        /// Base64-encoded raw output bytes.
        data: String,
    },

    /// Child exited. `expected` reflects the flag set by the last `kill`.
    #[serde(rename = "exit")]
    Exit {
        pane_id: PaneId,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        expected: bool,
    },

    /// Semantic activity derived from an exec child's structured events.
    #[serde(rename = "activity")]
    Activity { pane_id: PaneId, kind: ActivityKind },

    #[serde(rename = "list")]
    List { id: String, panes: Vec<PaneInfo> },

    #[serde(rename = "attached")]
    Attached {
        id: String,
        pane_id: PaneId,
        /// Base64-encoded scrollback replay.
        scrollback: String,
    },

    #[serde(rename = "killed")]
    Killed { id: String, pane_id: PaneId },

    #[serde(rename = "session")]
    Session {
        id: String,
        entries: Vec<SessionEntry>,
    },

    #[serde(rename = "error")]
    Error {
        id: String,
        code: ErrorCode,
        message: String,
    },

    #[serde(rename = "ack")]
    Ack { id: String },

    #[serde(rename = "pong")]
    Pong { id: String },
}

impl DaemonMessage {
    /// The request ID this message responds to, if it is a response.
    pub fn response_id(&self) -> Option<&str> {
        match self {
            DaemonMessage::Spawned { id, .. } => id.as_deref(),
            DaemonMessage::List { id, .. }
            | DaemonMessage::Attached { id, .. }
            | DaemonMessage::Killed { id, .. }
            | DaemonMessage::Session { id, .. }
            | DaemonMessage::Error { id, .. }
            | DaemonMessage::Ack { id }
            | DaemonMessage::Pong { id } => Some(id),
            _ => None,
        }
    }
}

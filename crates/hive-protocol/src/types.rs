use serde::{Deserialize, Serialize};

/// Generate a newtype wrapper around `String` with standard trait impls.
///
/// Each generated type gets: `Debug`, `Clone`, `PartialEq`, `Eq`, `Hash`,
/// `Serialize`/`Deserialize` (transparent), `Display`, `Deref<Target=str>`,
/// `AsRef<str>`, `Borrow<str>`, `From<String>`, `From<&str>`.
macro_rules! newtype_string {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

newtype_string! {
    /// Lowercase agent role name (e.g., `"architect"`, `"worker-a"`).
    Role
}

newtype_string! {
    /// Opaque per-delivery identifier (UUID v4) minted by the injection engine.
    DeliveryId
}

/// Logical pane slot hosting one agent, addressed as a small integer (1..N).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaneId(u32);

impl PaneId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PaneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for PaneId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::str::FromStr for PaneId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>().map(Self)
    }
}

/// How an agent's child process is run.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Conversational TUI inside a PTY; input is keystrokes and escape codes.
    Interactive,
    /// Headless child without a PTY; emits a structured NDJSON event stream.
    Exec,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMode::Interactive => write!(f, "interactive"),
            AgentMode::Exec => write!(f, "exec"),
        }
    }
}

/// Semantic activity derived from an exec-mode child's structured events.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Start,
    Tool,
    Command,
    File,
    Stream,
    Done,
    Ready,
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityKind::Start => write!(f, "start"),
            ActivityKind::Tool => write!(f, "tool"),
            ActivityKind::Command => write!(f, "command"),
            ActivityKind::File => write!(f, "file"),
            ActivityKind::Stream => write!(f, "stream"),
            ActivityKind::Done => write!(f, "done"),
            ActivityKind::Ready => write!(f, "ready"),
        }
    }
}

/// Pane lifecycle as reported by the daemon.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaneStatus {
    Starting,
    Running,
    Exited,
    /// Exec child exited with code 0 while subscribed; eligible for
    /// immediate resume-by-session respawn.
    GracefullyCompleted,
}

impl std::fmt::Display for PaneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaneStatus::Starting => write!(f, "starting"),
            PaneStatus::Running => write!(f, "running"),
            PaneStatus::Exited => write!(f, "exited"),
            PaneStatus::GracefullyCompleted => write!(f, "gracefully_completed"),
        }
    }
}

/// Summary of a daemon pane as returned via IPC.
///
/// This is a process-centric wire type: the daemon knows about child
/// processes and working directories, not about roles, mailboxes, or
/// recovery state — those concepts live in hive-engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaneInfo {
    pub pane_id: PaneId,
    pub cwd: String,
    pub mode: AgentMode,
    pub status: PaneStatus,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pane_id_roundtrip() {
        let id = PaneId::new(3);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "3");
        let parsed: PaneId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_pane_id_from_str() {
        let id: PaneId = "6".parse().unwrap();
        assert_eq!(id.as_u32(), 6);
        assert!("x".parse::<PaneId>().is_err());
    }

    #[test]
    fn test_role_transparent_serde() {
        let role = Role::new("worker-a");
        let json = serde_json::to_string(&role).unwrap();
        assert_eq!(json, r#""worker-a""#);
        let parsed: Role = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, role);
        assert_eq!(&*parsed, "worker-a");
    }

    #[test]
    fn test_agent_mode_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&AgentMode::Interactive).unwrap(),
            r#""interactive""#
        );
        assert_eq!(serde_json::to_string(&AgentMode::Exec).unwrap(), r#""exec""#);
        let parsed: AgentMode = serde_json::from_str(r#""exec""#).unwrap();
        assert_eq!(parsed, AgentMode::Exec);
    }

    #[test]
    fn test_activity_kind_display_matches_serde() {
        for kind in [
            ActivityKind::Start,
            ActivityKind::Tool,
            ActivityKind::Command,
            ActivityKind::File,
            ActivityKind::Stream,
            ActivityKind::Done,
            ActivityKind::Ready,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn test_pane_info_optional_fields_omitted() {
        let info = PaneInfo {
            pane_id: PaneId::new(1),
            cwd: "/work".to_string(),
            mode: AgentMode::Interactive,
            status: PaneStatus::Running,
            created_at: "2026-03-01T10:00:00Z".to_string(),
            last_activity: None,
            session_id: None,
            pid: None,
            client_count: None,
            exit_code: None,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("session_id"));
        assert!(!json.contains("exit_code"));
        assert!(json.contains(r#""status":"running""#));
    }

    #[test]
    fn test_pane_status_display() {
        assert_eq!(PaneStatus::GracefullyCompleted.to_string(), "gracefully_completed");
        assert_eq!(PaneStatus::Exited.to_string(), "exited");
    }
}

//! Persisted session state: `session-state.json` in the workspace root.
//!
//! Written atomically (temp-file + rename) on every material change and on a
//! periodic snapshot timer. Readers tolerate a missing file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::DaemonError;

/// On-disk shape of `session-state.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Captured exec-session identifiers, keyed by pane id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sdk_sessions: BTreeMap<String, String>,
    /// Per-pane terminal state, keyed by pane id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub terminals: BTreeMap<String, TerminalEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalEntry {
    pub cwd: String,
    pub alive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    /// Bounded scrollback tail, lossy UTF-8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrollback: Option<String>,
}

impl SessionState {
    pub fn is_empty(&self) -> bool {
        self.sdk_sessions.is_empty() && self.terminals.is_empty()
    }
}

/// Load session state. A missing file is an empty initial state.
pub fn load_session_state(path: &Path) -> Result<SessionState, DaemonError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SessionState::default());
        }
        Err(e) => return Err(DaemonError::Io(e)),
    };

    let state: SessionState = serde_json::from_str(&content)?;
    debug!(
        event = "daemon.state.load_completed",
        path = %path.display(),
        terminals = state.terminals.len(),
        sdk_sessions = state.sdk_sessions.len(),
    );
    Ok(state)
}

/// Write session state atomically via temp-file + rename.
pub fn save_session_state(path: &Path, state: &SessionState) -> Result<(), DaemonError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(state)?;
    let temp_path = path.with_extension("json.tmp");

    if let Err(e) = fs::write(&temp_path, &json) {
        cleanup_temp_file(&temp_path, &e);
        return Err(DaemonError::Io(e));
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        cleanup_temp_file(&temp_path, &e);
        return Err(DaemonError::Io(e));
    }

    debug!(
        event = "daemon.state.save_completed",
        path = %path.display(),
        terminals = state.terminals.len(),
    );
    Ok(())
}

fn cleanup_temp_file(temp_file: &Path, original_error: &std::io::Error) {
    if let Err(cleanup_err) = fs::remove_file(temp_file) {
        warn!(
            event = "daemon.state.temp_file_cleanup_failed",
            temp_file = %temp_file.display(),
            original_error = %original_error,
            cleanup_error = %cleanup_err,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> SessionState {
        let mut state = SessionState::default();
        state
            .sdk_sessions
            .insert("2".to_string(), "th_0195f".to_string());
        state.terminals.insert(
            "1".to_string(),
            TerminalEntry {
                cwd: "/work/project".to_string(),
                alive: true,
                last_activity: Some("2026-03-01T10:00:00Z".to_string()),
                scrollback: Some("$ ls\nsrc\n".to_string()),
            },
        );
        state
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session-state.json");
        let state = load_session_state(&path).unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session-state.json");

        let state = sample_state();
        save_session_state(&path, &state).unwrap();

        let loaded = load_session_state(&path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_save_is_atomic_no_temp_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session-state.json");

        save_session_state(&path, &sample_state()).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_save_overwrites_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session-state.json");

        save_session_state(&path, &sample_state()).unwrap();

        let mut next = sample_state();
        next.terminals.get_mut("1").unwrap().alive = false;
        save_session_state(&path, &next).unwrap();

        let loaded = load_session_state(&path).unwrap();
        assert!(!loaded.terminals["1"].alive);
    }

    #[test]
    fn test_load_malformed_json_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session-state.json");
        fs::write(&path, "{ not json").unwrap();

        let result = load_session_state(&path);
        assert!(matches!(result, Err(DaemonError::Serde(_))));
    }

    #[test]
    fn test_empty_state_serializes_compact() {
        let json = serde_json::to_string(&SessionState::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_wire_shape_matches_expected_keys() {
        let json = serde_json::to_string(&sample_state()).unwrap();
        assert!(json.contains(r#""sdk_sessions":{"2":"th_0195f"}"#));
        assert!(json.contains(r#""terminals""#));
        assert!(json.contains(r#""cwd":"/work/project""#));
    }
}

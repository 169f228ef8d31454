//! Persisted sequence cursors: `message-state.json` in the workspace root.
//!
//! Tracks, per recipient, the highest delivered sequence per sender
//! (`lastSeen`) and each role's own outbound counter. Written atomically;
//! a missing file is an empty initial state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::EngineError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageState {
    #[serde(default)]
    pub sequences: BTreeMap<String, RecipientSequences>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipientSequences {
    #[serde(default)]
    pub outbound: u64,
    #[serde(default, rename = "lastSeen")]
    pub last_seen: BTreeMap<String, u64>,
}

/// Owns the message-state file and its in-memory mirror.
#[derive(Debug)]
pub struct SequenceStore {
    path: PathBuf,
    state: MessageState,
}

impl SequenceStore {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let state = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MessageState::default(),
            Err(e) => return Err(EngineError::Io(e)),
        };
        Ok(Self {
            path: path.to_path_buf(),
            state,
        })
    }

    /// Highest delivered sequence for `sender → recipient`; 0 = none yet.
    pub fn last_seen(&self, recipient: &str, sender: &str) -> u64 {
        self.state
            .sequences
            .get(recipient)
            .and_then(|r| r.last_seen.get(sender))
            .copied()
            .unwrap_or(0)
    }

    /// Record a delivered sequence. The cursor is monotonic: lower values
    /// never rewind it.
    pub fn record_delivered(
        &mut self,
        recipient: &str,
        sender: &str,
        seq: u64,
    ) -> Result<(), EngineError> {
        let entry = self
            .state
            .sequences
            .entry(recipient.to_string())
            .or_default();
        let cursor = entry.last_seen.entry(sender.to_string()).or_insert(0);
        if seq > *cursor {
            *cursor = seq;
            self.save()?;
        }
        Ok(())
    }

    /// Session-banner reset: `lastSeen[sender]` back to 0 for one recipient.
    pub fn reset_sender(&mut self, recipient: &str, sender: &str) -> Result<(), EngineError> {
        debug!(
            event = "engine.sequences.reset",
            recipient = recipient,
            sender = sender,
        );
        let entry = self
            .state
            .sequences
            .entry(recipient.to_string())
            .or_default();
        entry.last_seen.insert(sender.to_string(), 0);
        self.save()
    }

    /// Allocate the next outbound sequence for a sending role.
    pub fn next_outbound(&mut self, sender: &str) -> Result<u64, EngineError> {
        let entry = self.state.sequences.entry(sender.to_string()).or_default();
        entry.outbound += 1;
        let seq = entry.outbound;
        self.save()?;
        Ok(seq)
    }

    fn save(&self) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.state)?;
        let temp_path = self.path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&temp_path, &json) {
            cleanup_temp(&temp_path, &e);
            return Err(EngineError::Io(e));
        }
        if let Err(e) = std::fs::rename(&temp_path, &self.path) {
            cleanup_temp(&temp_path, &e);
            return Err(EngineError::Io(e));
        }
        Ok(())
    }
}

fn cleanup_temp(temp_path: &Path, original_error: &std::io::Error) {
    if let Err(cleanup_err) = std::fs::remove_file(temp_path) {
        warn!(
            event = "engine.sequences.temp_cleanup_failed",
            temp_file = %temp_path.display(),
            original_error = %original_error,
            cleanup_error = %cleanup_err,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &std::path::Path) -> SequenceStore {
        SequenceStore::load(&dir.join("message-state.json")).unwrap()
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert_eq!(s.last_seen("worker-a", "architect"), 0);
    }

    #[test]
    fn test_record_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut s = store(dir.path());
            s.record_delivered("worker-a", "architect", 5).unwrap();
        }
        let s = store(dir.path());
        assert_eq!(s.last_seen("worker-a", "architect"), 5);
    }

    #[test]
    fn test_cursor_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path());
        s.record_delivered("worker-a", "architect", 5).unwrap();
        s.record_delivered("worker-a", "architect", 3).unwrap();
        assert_eq!(s.last_seen("worker-a", "architect"), 5);
        s.record_delivered("worker-a", "architect", 6).unwrap();
        assert_eq!(s.last_seen("worker-a", "architect"), 6);
    }

    #[test]
    fn test_reset_sender_zeroes_one_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path());
        s.record_delivered("worker-a", "architect", 520).unwrap();
        s.record_delivered("worker-a", "operator", 9).unwrap();

        s.reset_sender("worker-a", "architect").unwrap();
        assert_eq!(s.last_seen("worker-a", "architect"), 0);
        assert_eq!(s.last_seen("worker-a", "operator"), 9);
    }

    #[test]
    fn test_next_outbound_increments_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut s = store(dir.path());
            assert_eq!(s.next_outbound("operator").unwrap(), 1);
            assert_eq!(s.next_outbound("operator").unwrap(), 2);
        }
        let mut s = store(dir.path());
        assert_eq!(s.next_outbound("operator").unwrap(), 3);
    }

    #[test]
    fn test_wire_shape_uses_last_seen_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path());
        s.record_delivered("worker-a", "architect", 1).unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("message-state.json")).unwrap();
        assert!(content.contains("\"lastSeen\""));
        assert!(content.contains("\"outbound\""));
        assert!(!content.contains("last_seen"));
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path());
        s.record_delivered("worker-a", "architect", 1).unwrap();
        assert!(!dir.path().join("message-state.json.tmp").exists());
    }
}

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("workspace root not found — set $HIVEMIND_WORKSPACE or run from a workspace")]
    WorkspaceNotFound,
}

/// Centralized path construction for a Hivemind workspace directory.
///
/// Single source of truth for every file the engine persists. Use `resolve()`
/// in production code and `from_dir()` in tests.
#[derive(Debug, Clone)]
pub struct HivePaths {
    workspace_dir: PathBuf,
}

impl HivePaths {
    /// Resolve the workspace root.
    ///
    /// Order: `$HIVEMIND_WORKSPACE` if set, otherwise the current directory.
    pub fn resolve() -> Result<Self, PathError> {
        if let Ok(dir) = std::env::var("HIVEMIND_WORKSPACE") {
            return Ok(Self {
                workspace_dir: PathBuf::from(dir),
            });
        }
        let cwd = std::env::current_dir().map_err(|_| PathError::WorkspaceNotFound)?;
        Ok(Self { workspace_dir: cwd })
    }

    /// Create paths from an explicit workspace directory. Use in tests.
    pub fn from_dir(workspace_dir: PathBuf) -> Self {
        Self { workspace_dir }
    }

    /// The workspace root directory.
    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    // --- Top-level subdirectories ---

    /// Mailbox directory: one trigger file per recipient role, plus
    /// `all.txt` and group files.
    pub fn triggers_dir(&self) -> PathBuf {
        self.workspace_dir.join("triggers")
    }

    /// Trigger file for a single recipient role or group name.
    pub fn trigger_file(&self, recipient: &str) -> PathBuf {
        self.triggers_dir().join(format!("{recipient}.txt"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.workspace_dir.join("workspace").join("logs")
    }

    // --- Top-level files ---

    pub fn daemon_socket(&self) -> PathBuf {
        self.workspace_dir.join("daemon.sock")
    }

    pub fn daemon_pid_file(&self) -> PathBuf {
        self.workspace_dir.join("daemon.pid")
    }

    /// Per-pane terminal state persisted by the daemon.
    pub fn session_state_file(&self) -> PathBuf {
        self.workspace_dir.join("session-state.json")
    }

    /// Per-recipient sequence cursors persisted by the trigger router.
    pub fn message_state_file(&self) -> PathBuf {
        self.workspace_dir.join("message-state.json")
    }

    pub fn config_file(&self) -> PathBuf {
        self.workspace_dir.join("hivemind.toml")
    }

    pub fn app_log_file(&self) -> PathBuf {
        self.logs_dir().join("app.log")
    }

    pub fn diagnostic_log_file(&self) -> PathBuf {
        self.logs_dir().join("diagnostic.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> HivePaths {
        HivePaths::from_dir(PathBuf::from("/work/hive"))
    }

    #[test]
    fn test_from_dir_sets_root() {
        let p = paths();
        assert_eq!(p.workspace_dir(), Path::new("/work/hive"));
    }

    #[test]
    fn test_top_level_files() {
        let p = paths();
        assert_eq!(p.daemon_socket(), PathBuf::from("/work/hive/daemon.sock"));
        assert_eq!(p.daemon_pid_file(), PathBuf::from("/work/hive/daemon.pid"));
        assert_eq!(
            p.session_state_file(),
            PathBuf::from("/work/hive/session-state.json")
        );
        assert_eq!(
            p.message_state_file(),
            PathBuf::from("/work/hive/message-state.json")
        );
        assert_eq!(p.config_file(), PathBuf::from("/work/hive/hivemind.toml"));
    }

    #[test]
    fn test_trigger_file_per_role() {
        let p = paths();
        assert_eq!(
            p.trigger_file("worker-a"),
            PathBuf::from("/work/hive/triggers/worker-a.txt")
        );
        assert_eq!(
            p.trigger_file("all"),
            PathBuf::from("/work/hive/triggers/all.txt")
        );
    }

    #[test]
    fn test_log_files_under_workspace_logs() {
        let p = paths();
        assert_eq!(
            p.app_log_file(),
            PathBuf::from("/work/hive/workspace/logs/app.log")
        );
        assert_eq!(
            p.diagnostic_log_file(),
            PathBuf::from("/work/hive/workspace/logs/diagnostic.log")
        );
    }

    #[test]
    fn test_resolve_uses_env_override() {
        // Avoid mutating process env in parallel tests: resolve() reads the
        // variable directly, so only assert the from_dir equivalence here.
        let p = HivePaths::from_dir(PathBuf::from("/tmp/hive-test"));
        assert!(p.daemon_socket().starts_with("/tmp/hive-test"));
    }
}

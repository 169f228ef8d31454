//! Engine configuration: the `[engine]`, `[[agents]]`, and `[[groups]]`
//! sections of the workspace `hivemind.toml`.

use hive_paths::HivePaths;
use hive_protocol::{AgentMode, PaneId, Role};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Timing and policy knobs for the coordination engine.
///
/// Every default mirrors the documented behavior of the injection, routing,
/// and recovery subsystems; override individual fields in `hivemind.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Injection ---
    /// Output quiescence required before injecting (ms).
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,
    /// Upper bound on the pre-flight idle wait (ms).
    #[serde(default = "default_preflight_wait_ms")]
    pub preflight_wait_ms: u64,
    /// Poll cadence for idle/verify loops (ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Human input within this window defers injection (ms).
    #[serde(default = "default_typing_guard_window_ms")]
    pub typing_guard_window_ms: u64,
    /// Maximum cooperative deferral before injecting anyway (ms).
    #[serde(default = "default_typing_guard_max_defer_ms")]
    pub typing_guard_max_defer_ms: u64,
    /// Submit delay when the target has been idle > idle_threshold (ms).
    #[serde(default = "default_submit_delay_idle_ms")]
    pub submit_delay_idle_ms: u64,
    /// Submit delay when the target was active within the idle threshold (ms).
    #[serde(default = "default_submit_delay_active_ms")]
    pub submit_delay_active_ms: u64,
    /// Submit delay when the target emitted output within 100ms (ms).
    #[serde(default = "default_submit_delay_busy_ms")]
    pub submit_delay_busy_ms: u64,
    /// Initial verification window after the submit keystroke (ms).
    #[serde(default = "default_verify_window_ms")]
    pub verify_window_ms: u64,
    /// Submit retries when verification sees no output at all.
    #[serde(default = "default_verify_retries")]
    pub verify_retries: u32,
    /// Interval between submit retries (ms).
    #[serde(default = "default_verify_retry_interval_ms")]
    pub verify_retry_interval_ms: u64,
    /// How quickly the input-lock bypass flag is cleared after submit (ms).
    #[serde(default = "default_bypass_clear_ms")]
    pub bypass_clear_ms: u64,
    /// Hard ceiling on one injection job (ms).
    #[serde(default = "default_job_ceiling_ms")]
    pub job_ceiling_ms: u64,
    /// Spacing between fan-out submissions to multiple recipients (ms).
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
    /// Stderr/exit grace window for exec-mode submissions (ms).
    #[serde(default = "default_exec_grace_ms")]
    pub exec_grace_ms: u64,

    // --- Trigger router ---
    /// End-to-end delivery acknowledgement timeout (ms).
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// File-watch debounce window (ms).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Empty reads within this window of our own clear are noise (ms).
    #[serde(default = "default_clear_suppress_ms")]
    pub clear_suppress_ms: u64,

    // --- Recovery ---
    /// Non-progress window that triggers escalation (s).
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,
    /// Initial wait between failed escalations (ms).
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    /// Backoff doubling cap (ms).
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Consecutive restart failures before the circuit opens.
    #[serde(default = "default_circuit_failure_limit")]
    pub circuit_failure_limit: u32,
    /// Circuit-open cooldown (s).
    #[serde(default = "default_circuit_cooldown_secs")]
    pub circuit_cooldown_secs: u64,
    /// Respawn exec agents immediately after a clean (code 0) exit.
    #[serde(default = "default_true")]
    pub exec_respawn_on_clean_exit: bool,
    /// Benign sentinel message submitted as the nudge step.
    #[serde(default = "default_nudge_text")]
    pub nudge_text: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: default_idle_threshold_ms(),
            preflight_wait_ms: default_preflight_wait_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            typing_guard_window_ms: default_typing_guard_window_ms(),
            typing_guard_max_defer_ms: default_typing_guard_max_defer_ms(),
            submit_delay_idle_ms: default_submit_delay_idle_ms(),
            submit_delay_active_ms: default_submit_delay_active_ms(),
            submit_delay_busy_ms: default_submit_delay_busy_ms(),
            verify_window_ms: default_verify_window_ms(),
            verify_retries: default_verify_retries(),
            verify_retry_interval_ms: default_verify_retry_interval_ms(),
            bypass_clear_ms: default_bypass_clear_ms(),
            job_ceiling_ms: default_job_ceiling_ms(),
            stagger_ms: default_stagger_ms(),
            exec_grace_ms: default_exec_grace_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            debounce_ms: default_debounce_ms(),
            clear_suppress_ms: default_clear_suppress_ms(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            circuit_failure_limit: default_circuit_failure_limit(),
            circuit_cooldown_secs: default_circuit_cooldown_secs(),
            exec_respawn_on_clean_exit: true,
            nudge_text: default_nudge_text(),
        }
    }
}

fn default_idle_threshold_ms() -> u64 {
    500
}
fn default_preflight_wait_ms() -> u64 {
    5_000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_typing_guard_window_ms() -> u64 {
    2_000
}
fn default_typing_guard_max_defer_ms() -> u64 {
    10_000
}
fn default_submit_delay_idle_ms() -> u64 {
    50
}
fn default_submit_delay_active_ms() -> u64 {
    150
}
fn default_submit_delay_busy_ms() -> u64 {
    300
}
fn default_verify_window_ms() -> u64 {
    2_000
}
fn default_verify_retries() -> u32 {
    5
}
fn default_verify_retry_interval_ms() -> u64 {
    200
}
fn default_bypass_clear_ms() -> u64 {
    80
}
fn default_job_ceiling_ms() -> u64 {
    60_000
}
fn default_stagger_ms() -> u64 {
    150
}
fn default_exec_grace_ms() -> u64 {
    300
}
fn default_ack_timeout_ms() -> u64 {
    60_000
}
fn default_debounce_ms() -> u64 {
    200
}
fn default_clear_suppress_ms() -> u64 {
    1_500
}
fn default_stuck_threshold_secs() -> u64 {
    60
}
fn default_backoff_initial_ms() -> u64 {
    5_000
}
fn default_backoff_cap_ms() -> u64 {
    300_000
}
fn default_circuit_failure_limit() -> u32 {
    3
}
fn default_circuit_cooldown_secs() -> u64 {
    600
}
fn default_true() -> bool {
    true
}
fn default_nudge_text() -> String {
    "Status check: please reply with a one-line summary of what you are doing.".to_string()
}

/// One agent in the roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub pane_id: PaneId,
    pub role: Role,
    pub mode: AgentMode,
    pub cwd: String,
    pub argv: Vec<String>,
    /// Extra argv appended when respawning with a captured session id.
    /// The literal `{session_id}` is substituted.
    #[serde(default)]
    pub resume_args: Vec<String>,
    /// One-time identity banner prefixed to the first exec submission.
    #[serde(default)]
    pub identity_banner: Option<String>,
}

impl AgentConfig {
    /// Argv for a respawn, appending resume args when a session id is known.
    pub fn respawn_argv(&self, session_id: Option<&str>) -> Vec<String> {
        let mut argv = self.argv.clone();
        if let Some(sid) = session_id {
            argv.extend(
                self.resume_args
                    .iter()
                    .map(|arg| arg.replace("{session_id}", sid)),
            );
        }
        argv
    }
}

/// A broadcast group: a mailbox name fanning out to member roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub members: Vec<Role>,
}

/// Full parsed `hivemind.toml` as the engine sees it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HivemindConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

impl HivemindConfig {
    /// Validate roster and group invariants.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut pane_ids = std::collections::HashSet::new();
        let mut roles = std::collections::HashSet::new();

        for agent in &self.agents {
            if !pane_ids.insert(agent.pane_id) {
                return Err(EngineError::ConfigInvalid(format!(
                    "duplicate pane_id {} in roster",
                    agent.pane_id
                )));
            }
            if !roles.insert(agent.role.clone()) {
                return Err(EngineError::ConfigInvalid(format!(
                    "duplicate role {} in roster",
                    agent.role
                )));
            }
            if agent.argv.is_empty() {
                return Err(EngineError::ConfigInvalid(format!(
                    "agent {} has empty argv",
                    agent.role
                )));
            }
            if agent.role.as_ref() == "all" {
                return Err(EngineError::ConfigInvalid(
                    "role name 'all' is reserved for broadcast".to_string(),
                ));
            }
        }

        for group in &self.groups {
            if group.name == "all" || roles.contains(group.name.as_str()) {
                return Err(EngineError::ConfigInvalid(format!(
                    "group name {} collides with a role or the broadcast mailbox",
                    group.name
                )));
            }
            for member in &group.members {
                if !roles.contains(member.as_ref()) {
                    return Err(EngineError::ConfigInvalid(format!(
                        "group {} references unknown role {}",
                        group.name, member
                    )));
                }
            }
        }

        if self.engine.verify_retries == 0 {
            return Err(EngineError::ConfigInvalid(
                "verify_retries must be > 0".to_string(),
            ));
        }
        if self.engine.job_ceiling_ms < self.engine.verify_window_ms {
            return Err(EngineError::ConfigInvalid(
                "job_ceiling_ms must be >= verify_window_ms".to_string(),
            ));
        }

        Ok(())
    }
}

/// Load `hivemind.toml` from the workspace.
///
/// A missing file yields defaults with an empty roster; hosts that require
/// agents check for that themselves.
pub fn load_config(paths: &HivePaths) -> Result<HivemindConfig, EngineError> {
    let path = paths.config_file();
    let config = match std::fs::read_to_string(&path) {
        Ok(contents) => toml::from_str::<HivemindConfig>(&contents)
            .map_err(|e| EngineError::ConfigInvalid(format!("{}: {}", path.display(), e)))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => HivemindConfig::default(),
        Err(e) => return Err(EngineError::Io(e)),
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
[engine]
idle_threshold_ms = 400
stuck_threshold_secs = 45

[[agents]]
pane_id = 1
role = "architect"
mode = "interactive"
cwd = "/work/project"
argv = ["claude", "--continue"]

[[agents]]
pane_id = 2
role = "worker-a"
mode = "exec"
cwd = "/work/project"
argv = ["agent", "exec", "--json"]
resume_args = ["--resume", "{session_id}"]

[[groups]]
name = "workers"
members = ["worker-a"]
"#
    }

    #[test]
    fn test_engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.idle_threshold_ms, 500);
        assert_eq!(config.preflight_wait_ms, 5_000);
        assert_eq!(config.typing_guard_window_ms, 2_000);
        assert_eq!(config.typing_guard_max_defer_ms, 10_000);
        assert_eq!(config.verify_retries, 5);
        assert_eq!(config.job_ceiling_ms, 60_000);
        assert_eq!(config.ack_timeout_ms, 60_000);
        assert_eq!(config.stuck_threshold_secs, 60);
        assert_eq!(config.backoff_cap_ms, 300_000);
        assert_eq!(config.circuit_failure_limit, 3);
        assert_eq!(config.circuit_cooldown_secs, 600);
        assert!(config.exec_respawn_on_clean_exit);
    }

    #[test]
    fn test_parse_full_config() {
        let config: HivemindConfig = toml::from_str(sample_toml()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.engine.idle_threshold_ms, 400);
        assert_eq!(config.engine.stuck_threshold_secs, 45);
        // Unset engine fields keep defaults
        assert_eq!(config.engine.verify_retries, 5);

        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].role, Role::new("architect"));
        assert_eq!(config.agents[1].mode, AgentMode::Exec);
        assert_eq!(config.groups[0].members, vec![Role::new("worker-a")]);
    }

    #[test]
    fn test_respawn_argv_substitutes_session_id() {
        let config: HivemindConfig = toml::from_str(sample_toml()).unwrap();
        let worker = &config.agents[1];

        let argv = worker.respawn_argv(Some("th_99"));
        assert_eq!(
            argv,
            vec!["agent", "exec", "--json", "--resume", "th_99"]
        );

        // No session id: no resume args
        let argv = worker.respawn_argv(None);
        assert_eq!(argv, vec!["agent", "exec", "--json"]);
    }

    #[test]
    fn test_validate_duplicate_pane_fails() {
        let toml = r#"
[[agents]]
pane_id = 1
role = "a"
mode = "interactive"
cwd = "/w"
argv = ["x"]

[[agents]]
pane_id = 1
role = "b"
mode = "interactive"
cwd = "/w"
argv = ["x"]
"#;
        let config: HivemindConfig = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate pane_id"));
    }

    #[test]
    fn test_validate_reserved_role_fails() {
        let toml = r#"
[[agents]]
pane_id = 1
role = "all"
mode = "interactive"
cwd = "/w"
argv = ["x"]
"#;
        let config: HivemindConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_group_unknown_member_fails() {
        let toml = r#"
[[agents]]
pane_id = 1
role = "a"
mode = "interactive"
cwd = "/w"
argv = ["x"]

[[groups]]
name = "team"
members = ["ghost"]
"#;
        let config: HivemindConfig = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown role"));
    }

    #[test]
    fn test_load_config_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HivePaths::from_dir(dir.path().to_path_buf());
        let config = load_config(&paths).unwrap();
        assert!(config.agents.is_empty());
        assert_eq!(config.engine.idle_threshold_ms, 500);
    }

    #[test]
    fn test_load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HivePaths::from_dir(dir.path().to_path_buf());
        std::fs::write(paths.config_file(), sample_toml()).unwrap();
        let config = load_config(&paths).unwrap();
        assert_eq!(config.agents.len(), 2);
    }

    #[test]
    fn test_load_config_malformed_fails() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HivePaths::from_dir(dir.path().to_path_buf());
        std::fs::write(paths.config_file(), "agents = 3").unwrap();
        assert!(load_config(&paths).is_err());
    }
}

//! Pane registry: owns every agent child process and its runtime state.
//!
//! The daemon is process-centric: it knows about panes, commands, and
//! working directories, not about roles, mailboxes, or recovery. Those
//! concepts live in hive-engine.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::TimeZone;
use hive_protocol::{
    AgentMode, DaemonMessage, PaneId, PaneInfo, PaneStatus, SessionEntry,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::errors::DaemonError;
use crate::events::{OutputSinks, PaneInternalEvent, lock_scrollback};
use crate::exec::ExecPane;
use crate::mock::MockPane;
use crate::pty::{PtyPane, spawn_pty_reader};
use crate::scrollback::ScrollbackBuffer;
use crate::state::{SessionState, TerminalEntry, load_session_state, save_session_state};
use crate::types::DaemonConfig;

/// Unique identifier for a connected client.
pub type ClientId = u64;

/// Parameters for spawning an agent child in a pane.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub pane_id: PaneId,
    pub cwd: String,
    pub mode: AgentMode,
    pub argv: Vec<String>,
    pub dry_run: bool,
    pub env: Vec<(String, String)>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

/// Tagged variant over the pane capability set.
///
/// New CLI child types add a variant without touching callers.
pub enum PaneBackend {
    Pty(PtyPane),
    Exec(ExecPane),
    Mock(MockPane),
}

/// One pane's runtime record.
pub struct Pane {
    pane_id: PaneId,
    cwd: String,
    mode: AgentMode,
    status: PaneStatus,
    created_at: String,
    /// Suppresses recovery for the next exit event only.
    expected_exit: bool,
    session_id: Option<String>,
    backend: Option<PaneBackend>,
    pid: Option<u32>,
    exit_code: Option<i32>,
    scrollback: Arc<Mutex<ScrollbackBuffer>>,
    /// Epoch ms of last observed output; 0 = never.
    last_activity: Arc<AtomicI64>,
    attached_clients: HashSet<ClientId>,
}

impl Pane {
    fn alive(&self) -> bool {
        matches!(self.status, PaneStatus::Starting | PaneStatus::Running)
    }

    fn to_pane_info(&self) -> PaneInfo {
        PaneInfo {
            pane_id: self.pane_id,
            cwd: self.cwd.clone(),
            mode: self.mode,
            status: self.status,
            created_at: self.created_at.clone(),
            last_activity: ms_to_rfc3339(self.last_activity.load(Ordering::Relaxed)),
            session_id: self.session_id.clone(),
            pid: self.pid,
            client_count: Some(self.attached_clients.len()),
            exit_code: self.exit_code,
        }
    }
}

/// Orchestrates pane lifecycle within the daemon.
pub struct PaneManager {
    panes: HashMap<PaneId, Pane>,
    config: DaemonConfig,
    events_tx: broadcast::Sender<DaemonMessage>,
    internal_tx: mpsc::UnboundedSender<PaneInternalEvent>,
    /// State loaded at daemon start. Children do not survive the daemon, so
    /// entries only seed `cwd`/`session_id` for the next spawn.
    persisted: SessionState,
    next_client_id: ClientId,
}

impl PaneManager {
    pub fn new(
        config: DaemonConfig,
        events_tx: broadcast::Sender<DaemonMessage>,
        internal_tx: mpsc::UnboundedSender<PaneInternalEvent>,
    ) -> Self {
        let mut persisted =
            load_session_state(&config.session_state_path).unwrap_or_else(|e| {
                warn!(
                    event = "daemon.panes.state_load_failed",
                    path = %config.session_state_path.display(),
                    error = %e,
                );
                SessionState::default()
            });

        // No child survives a daemon restart; correct stale liveness flags.
        for entry in persisted.terminals.values_mut() {
            entry.alive = false;
        }

        Self {
            panes: HashMap::new(),
            config,
            events_tx,
            internal_tx,
            persisted,
            next_client_id: 1,
        }
    }

    /// Allocate a new client ID.
    pub fn next_client_id(&mut self) -> ClientId {
        let id = self.next_client_id;
        self.next_client_id += 1;
        id
    }

    /// Spawn an agent child. Fails with `AlreadySpawned` when the pane holds
    /// a live child; an exited pane slot is reused (restart path).
    pub fn spawn(&mut self, req: SpawnRequest) -> Result<PaneInfo, DaemonError> {
        if let Some(existing) = self.panes.get(&req.pane_id)
            && existing.alive()
        {
            return Err(DaemonError::AlreadySpawned(req.pane_id));
        }

        info!(
            event = "daemon.panes.spawn_started",
            pane_id = %req.pane_id,
            mode = %req.mode,
            dry_run = req.dry_run,
            cwd = %req.cwd,
        );

        let scrollback = Arc::new(Mutex::new(ScrollbackBuffer::new(
            self.config.scrollback_buffer_size,
        )));
        let last_activity = Arc::new(AtomicI64::new(0));
        let sinks = OutputSinks {
            pane_id: req.pane_id,
            events_tx: self.events_tx.clone(),
            scrollback: scrollback.clone(),
            last_activity: last_activity.clone(),
            internal_tx: self.internal_tx.clone(),
        };

        let rows = req.rows.unwrap_or(self.config.default_rows);
        let cols = req.cols.unwrap_or(self.config.default_cols);
        let cwd_path = std::path::PathBuf::from(&req.cwd);

        let (backend, pid) = if req.dry_run {
            (PaneBackend::Mock(MockPane::spawn(req.pane_id, sinks)), None)
        } else {
            match req.mode {
                AgentMode::Interactive => {
                    let pty = PtyPane::spawn(
                        req.pane_id,
                        &req.argv,
                        &cwd_path,
                        rows,
                        cols,
                        &req.env,
                    )?;
                    let pid = pty.child_process_id();
                    let reader = pty.try_clone_reader()?;
                    spawn_pty_reader(reader, sinks);
                    (PaneBackend::Pty(pty), pid)
                }
                AgentMode::Exec => {
                    let exec =
                        ExecPane::spawn(req.pane_id, &req.argv, &cwd_path, &req.env, sinks)?;
                    let pid = exec.pid();
                    (PaneBackend::Exec(exec), pid)
                }
                _ => {
                    return Err(DaemonError::ProtocolError(
                        "unknown agent mode".into(),
                    ));
                }
            }
        };

        // Seed the session id from persisted state so a restarted engine can
        // still read it before the child re-announces one.
        let session_id = self
            .persisted
            .sdk_sessions
            .get(&req.pane_id.to_string())
            .cloned();

        let pane = Pane {
            pane_id: req.pane_id,
            cwd: req.cwd.clone(),
            mode: req.mode,
            status: PaneStatus::Running,
            created_at: chrono::Utc::now().to_rfc3339(),
            expected_exit: false,
            session_id,
            backend: Some(backend),
            pid,
            exit_code: None,
            scrollback,
            last_activity,
            attached_clients: HashSet::new(),
        };

        let info = pane.to_pane_info();
        self.panes.insert(req.pane_id, pane);

        // Broadcast notification (no request id).
        let _ = self.events_tx.send(DaemonMessage::Spawned {
            id: None,
            pane_id: info.pane_id,
            mode: info.mode,
            pid: info.pid,
            session_id: info.session_id.clone(),
        });

        self.persist();

        info!(
            event = "daemon.panes.spawn_completed",
            pane_id = %req.pane_id,
            pid = ?pid,
        );

        Ok(info)
    }

    /// Write bytes to a pane's child stdin.
    pub fn write(&self, pane_id: PaneId, data: &[u8]) -> Result<(), DaemonError> {
        let pane = self
            .panes
            .get(&pane_id)
            .ok_or(DaemonError::NotFound(pane_id))?;
        if !pane.alive() {
            return Err(DaemonError::NotAlive(pane_id));
        }
        match pane.backend.as_ref() {
            Some(PaneBackend::Pty(pty)) => pty.write_stdin(data),
            Some(PaneBackend::Exec(exec)) => exec.write_stdin(pane_id, data),
            Some(PaneBackend::Mock(mock)) => mock.write_stdin(pane_id, data),
            None => Err(DaemonError::NotAlive(pane_id)),
        }
    }

    /// Write 0x03 to a PTY pane's stdin. Documented no-op for exec and mock.
    pub fn interrupt(&self, pane_id: PaneId) -> Result<(), DaemonError> {
        let pane = self
            .panes
            .get(&pane_id)
            .ok_or(DaemonError::NotFound(pane_id))?;
        if !pane.alive() {
            return Err(DaemonError::NotAlive(pane_id));
        }
        match pane.backend.as_ref() {
            Some(PaneBackend::Pty(pty)) => pty.interrupt(),
            _ => {
                debug!(
                    event = "daemon.panes.interrupt_noop",
                    pane_id = %pane_id,
                    mode = %pane.mode,
                );
                Ok(())
            }
        }
    }

    /// Resize a PTY pane. No-op for exec and mock panes.
    pub fn resize(&mut self, pane_id: PaneId, rows: u16, cols: u16) -> Result<(), DaemonError> {
        let pane = self
            .panes
            .get_mut(&pane_id)
            .ok_or(DaemonError::NotFound(pane_id))?;
        match pane.backend.as_mut() {
            Some(PaneBackend::Pty(pty)) => pty.resize(rows, cols),
            Some(_) => {
                debug!(event = "daemon.panes.resize_noop", pane_id = %pane_id);
                Ok(())
            }
            None => Err(DaemonError::NotAlive(pane_id)),
        }
    }

    /// Kill a pane's child. The exit event flows through the backend's
    /// reader/supervisor task and lands in `handle_exit`.
    pub fn kill(&mut self, pane_id: PaneId, expected: bool) -> Result<(), DaemonError> {
        let pane = self
            .panes
            .get_mut(&pane_id)
            .ok_or(DaemonError::NotFound(pane_id))?;
        if !pane.alive() {
            return Err(DaemonError::NotAlive(pane_id));
        }

        info!(
            event = "daemon.panes.kill_started",
            pane_id = %pane_id,
            expected = expected,
        );

        pane.expected_exit = expected;
        match pane.backend.as_mut() {
            Some(PaneBackend::Pty(pty)) => pty.kill()?,
            Some(PaneBackend::Exec(exec)) => exec.kill(),
            Some(PaneBackend::Mock(mock)) => mock.kill(),
            None => return Err(DaemonError::NotAlive(pane_id)),
        }
        Ok(())
    }

    /// Handle a child-exit notification from a backend task.
    ///
    /// Consumes the pane's `expected_exit` flag (it suppresses recovery for
    /// this one exit only), resolves the exit code, transitions status, and
    /// broadcasts the `exit` event.
    pub fn handle_exit(&mut self, pane_id: PaneId, reported_code: Option<i32>) {
        let Some(pane) = self.panes.get_mut(&pane_id) else {
            debug!(event = "daemon.panes.exit_unknown_pane", pane_id = %pane_id);
            return;
        };

        if !pane.alive() {
            // Reader EOF and supervisor exit can both fire; first one wins.
            return;
        }

        let mut code = reported_code;
        if code.is_none()
            && let Some(PaneBackend::Pty(pty)) = pane.backend.as_mut()
        {
            code = pty.try_exit_code();
        }

        let expected = pane.expected_exit;
        pane.expected_exit = false;

        pane.status = if pane.mode == AgentMode::Exec && code == Some(0) && !expected {
            PaneStatus::GracefullyCompleted
        } else {
            PaneStatus::Exited
        };
        pane.exit_code = code;
        pane.backend = None;
        pane.pid = None;

        info!(
            event = "daemon.panes.exit_completed",
            pane_id = %pane_id,
            code = ?code,
            expected = expected,
            status = %pane.status,
        );

        let _ = self.events_tx.send(DaemonMessage::Exit {
            pane_id,
            code,
            expected,
        });

        self.persist();
    }

    /// Record an exec child's announced session identifier.
    pub fn capture_session(&mut self, pane_id: PaneId, session_id: String) {
        info!(
            event = "daemon.panes.session_captured",
            pane_id = %pane_id,
            session_id = %session_id,
        );
        if let Some(pane) = self.panes.get_mut(&pane_id) {
            pane.session_id = Some(session_id.clone());
        }
        self.persisted
            .sdk_sessions
            .insert(pane_id.to_string(), session_id);
        self.persist();
    }

    /// Attach a client: marks it for `data` forwarding and returns the
    /// scrollback replay.
    pub fn attach(&mut self, pane_id: PaneId, client_id: ClientId) -> Result<Vec<u8>, DaemonError> {
        let pane = self
            .panes
            .get_mut(&pane_id)
            .ok_or(DaemonError::NotFound(pane_id))?;
        pane.attached_clients.insert(client_id);
        debug!(
            event = "daemon.panes.client_attached",
            pane_id = %pane_id,
            client_id = client_id,
            client_count = pane.attached_clients.len(),
        );
        Ok(lock_scrollback(&pane.scrollback, pane_id).contents())
    }

    /// Detach a client from all panes (called on connection close).
    pub fn detach_client_from_all(&mut self, client_id: ClientId) {
        for pane in self.panes.values_mut() {
            pane.attached_clients.remove(&client_id);
        }
    }

    pub fn get(&self, pane_id: PaneId) -> Option<PaneInfo> {
        self.panes.get(&pane_id).map(|p| p.to_pane_info())
    }

    pub fn list(&self) -> Vec<PaneInfo> {
        let mut infos: Vec<PaneInfo> = self.panes.values().map(|p| p.to_pane_info()).collect();
        infos.sort_by_key(|i| i.pane_id);
        infos
    }

    pub fn any_alive(&self) -> bool {
        self.panes.values().any(|p| p.alive())
    }

    /// Session entries as exposed by `get_session`: live panes plus
    /// persisted leftovers for panes not currently spawned.
    pub fn session_entries(&self, pane_id: Option<PaneId>) -> Vec<SessionEntry> {
        let state = self.snapshot();
        let mut entries: Vec<SessionEntry> = state
            .terminals
            .iter()
            .filter_map(|(key, term)| {
                let id: PaneId = key.parse().ok()?;
                if let Some(wanted) = pane_id
                    && wanted != id
                {
                    return None;
                }
                Some(SessionEntry {
                    pane_id: id,
                    cwd: term.cwd.clone(),
                    alive: term.alive,
                    last_activity: term.last_activity.clone(),
                    session_id: state.sdk_sessions.get(key).cloned(),
                })
            })
            .collect();
        entries.sort_by_key(|e| e.pane_id);
        entries
    }

    /// Drop persisted state for one pane, or all panes.
    pub fn clear_session(&mut self, pane_id: Option<PaneId>) {
        match pane_id {
            Some(id) => {
                let key = id.to_string();
                self.persisted.sdk_sessions.remove(&key);
                self.persisted.terminals.remove(&key);
            }
            None => {
                self.persisted = SessionState::default();
            }
        }
        self.persist();
    }

    /// Current state as it should be persisted.
    pub fn snapshot(&self) -> SessionState {
        let mut state = self.persisted.clone();
        for (pane_id, pane) in &self.panes {
            let key = pane_id.to_string();
            let scrollback_tail = lock_scrollback(&pane.scrollback, *pane_id)
                .tail(self.config.persisted_scrollback_bytes);
            state.terminals.insert(
                key.clone(),
                TerminalEntry {
                    cwd: pane.cwd.clone(),
                    alive: pane.alive(),
                    last_activity: ms_to_rfc3339(pane.last_activity.load(Ordering::Relaxed)),
                    scrollback: (!scrollback_tail.is_empty())
                        .then(|| String::from_utf8_lossy(&scrollback_tail).into_owned()),
                },
            );
            if let Some(session_id) = &pane.session_id {
                state.sdk_sessions.insert(key, session_id.clone());
            }
        }
        state
    }

    /// Write the snapshot to disk; load + IO failures are logged, not fatal.
    pub fn persist(&self) {
        let state = self.snapshot();
        if let Err(e) = save_session_state(&self.config.session_state_path, &state) {
            warn!(
                event = "daemon.panes.persist_failed",
                path = %self.config.session_state_path.display(),
                error = %e,
            );
        }
    }

    /// Kill every live pane with `expected=true` (shutdown path).
    pub fn kill_all(&mut self) {
        let live: Vec<PaneId> = self
            .panes
            .values()
            .filter(|p| p.alive())
            .map(|p| p.pane_id)
            .collect();
        for pane_id in live {
            if let Err(e) = self.kill(pane_id, true) {
                warn!(
                    event = "daemon.panes.shutdown_kill_failed",
                    pane_id = %pane_id,
                    error = %e,
                );
            }
        }
    }

    /// Whether a client is attached to a pane (used by connections to
    /// filter `data` frames).
    pub fn is_attached(&self, pane_id: PaneId, client_id: ClientId) -> bool {
        self.panes
            .get(&pane_id)
            .is_some_and(|p| p.attached_clients.contains(&client_id))
    }

    pub fn pane_count(&self) -> usize {
        self.panes.len()
    }
}

fn ms_to_rfc3339(ms: i64) -> Option<String> {
    if ms <= 0 {
        return None;
    }
    chrono::Utc
        .timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339())
}

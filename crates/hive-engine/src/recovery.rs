//! Recovery manager: detects agents that stopped making progress or exited,
//! and escalates nudge → interrupt → restart with exponential backoff and a
//! per-agent circuit breaker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use hive_protocol::{AgentMode, DaemonMessage, DeliveryId, PaneId, Role};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityEvent, ActivitySink};
use crate::client::DaemonClient;
use crate::config::{AgentConfig, EngineConfig};
use crate::errors::EngineError;
use crate::inject::{InjectionEngine, InjectionRequest};
use crate::roster::Roster;
use crate::tracker::PaneTracker;

/// How often the stuck checker runs.
const TICK_INTERVAL: Duration = Duration::from_millis(1_000);

/// Escalation ladder position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryStep {
    #[default]
    None,
    Nudge,
    Interrupt,
    Restart,
}

impl RecoveryStep {
    fn next(self) -> Self {
        match self {
            RecoveryStep::None => RecoveryStep::Nudge,
            RecoveryStep::Nudge => RecoveryStep::Interrupt,
            RecoveryStep::Interrupt | RecoveryStep::Restart => RecoveryStep::Restart,
        }
    }
}

impl std::fmt::Display for RecoveryStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryStep::None => write!(f, "none"),
            RecoveryStep::Nudge => write!(f, "nudge"),
            RecoveryStep::Interrupt => write!(f, "interrupt"),
            RecoveryStep::Restart => write!(f, "restart"),
        }
    }
}

/// Per-agent recovery bookkeeping. Created lazily; reset on progress.
#[derive(Debug)]
struct RecoveryRecord {
    step: RecoveryStep,
    stuck_count: u32,
    last_attempt: Option<Instant>,
    backoff: Duration,
    restart_failures: u32,
    circuit_open_until: Option<Instant>,
    /// Exit-driven restart scheduled for this instant.
    restart_due: Option<Instant>,
    recovering: bool,
}

impl RecoveryRecord {
    fn new(backoff_initial: Duration) -> Self {
        Self {
            step: RecoveryStep::None,
            stuck_count: 0,
            last_attempt: None,
            backoff: backoff_initial,
            restart_failures: 0,
            circuit_open_until: None,
            restart_due: None,
            recovering: false,
        }
    }

    /// Progress observed: back to a clean slate, circuit closed.
    fn reset(&mut self, backoff_initial: Duration) {
        *self = Self::new(backoff_initial);
    }

    fn circuit_open(&self, now: Instant) -> bool {
        self.circuit_open_until.is_some_and(|until| now < until)
    }

    /// Whether the next escalation attempt is allowed yet.
    ///
    /// Steps are gated by the stuck threshold; repeated restarts also wait
    /// out the (doubling) backoff.
    fn attempt_allowed(&self, stuck_threshold: Duration, now: Instant) -> bool {
        let Some(last) = self.last_attempt else {
            return true;
        };
        let gate = if self.step == RecoveryStep::Restart {
            stuck_threshold.max(self.backoff)
        } else {
            stuck_threshold
        };
        now.duration_since(last) >= gate
    }

    fn double_backoff(&mut self, cap: Duration) {
        self.backoff = (self.backoff * 2).min(cap);
    }
}

/// One row of the health snapshot consumed by dashboards and the CLI.
#[derive(Debug, Clone)]
pub struct AgentHealth {
    pub pane_id: PaneId,
    pub role: Role,
    pub alive: bool,
    /// Seconds since the last observed progress, if any was ever observed.
    pub last_activity_secs: Option<u64>,
    pub stuck_count: u32,
    pub step: RecoveryStep,
    pub recovering: bool,
    pub circuit_open: bool,
}

pub struct RecoveryManager {
    config: EngineConfig,
    roster: Arc<Roster>,
    client: Arc<DaemonClient>,
    tracker: PaneTracker,
    injector: InjectionEngine,
    sink: Arc<dyn ActivitySink>,
    /// Respawn children as dry-run mocks (matches how the host spawned them).
    dry_run: bool,
    records: Mutex<HashMap<PaneId, RecoveryRecord>>,
}

impl RecoveryManager {
    pub fn new(
        config: EngineConfig,
        roster: Arc<Roster>,
        client: Arc<DaemonClient>,
        tracker: PaneTracker,
        injector: InjectionEngine,
        sink: Arc<dyn ActivitySink>,
        dry_run: bool,
    ) -> Self {
        Self {
            config,
            roster,
            client,
            tracker,
            injector,
            sink,
            dry_run,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Run exit handling and stuck detection until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut events = self.client.subscribe();
        let mut tick = tokio::time::interval(TICK_INTERVAL);

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(DaemonMessage::Exit { pane_id, code, expected }) => {
                            self.handle_exit(pane_id, code, expected).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!(event = "engine.recovery.event_stream_closed");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(event = "engine.recovery.events_lagged", skipped = skipped);
                        }
                    }
                }
                _ = tick.tick() => {
                    self.tick().await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }

    /// Exit policy: expected exits are planned; exec clean exits respawn
    /// immediately with resume-by-session; anything else restarts after the
    /// current backoff.
    async fn handle_exit(&self, pane_id: PaneId, code: Option<i32>, expected: bool) {
        let Some(agent) = self.roster.agent_for_pane(pane_id) else {
            return;
        };

        if expected {
            debug!(event = "engine.recovery.expected_exit", pane_id = %pane_id);
            return;
        }

        if agent.mode == AgentMode::Exec
            && code == Some(0)
            && self.config.exec_respawn_on_clean_exit
        {
            info!(
                event = "engine.recovery.graceful_respawn",
                pane_id = %pane_id,
                role = %agent.role,
            );
            if let Err(e) = self.respawn(agent).await {
                warn!(
                    event = "engine.recovery.graceful_respawn_failed",
                    pane_id = %pane_id,
                    error = %e,
                );
            }
            return;
        }

        let backoff_initial = Duration::from_millis(self.config.backoff_initial_ms);
        let mut records = self.lock_records();
        let record = records
            .entry(pane_id)
            .or_insert_with(|| RecoveryRecord::new(backoff_initial));
        let due = Instant::now() + record.backoff;
        record.restart_due = Some(due);
        record.recovering = true;
        info!(
            event = "engine.recovery.restart_scheduled",
            pane_id = %pane_id,
            code = ?code,
            backoff_ms = record.backoff.as_millis() as u64,
        );
    }

    /// Periodic pass: due exit-restarts, circuit bookkeeping, stuck
    /// escalation. Per-agent isolation — one agent's failure never blocks
    /// the others' checks.
    async fn tick(&self) {
        let now = Instant::now();
        let stuck_threshold = Duration::from_secs(self.config.stuck_threshold_secs);

        for agent in self.roster.agents() {
            let pane_id = agent.pane_id;

            // Decide under the lock, act after dropping it.
            enum Action {
                Nothing,
                Restart,
                Escalate(RecoveryStep),
            }

            let action = {
                let backoff_initial = Duration::from_millis(self.config.backoff_initial_ms);
                let mut records = self.lock_records();
                let record = records
                    .entry(pane_id)
                    .or_insert_with(|| RecoveryRecord::new(backoff_initial));

                let progress_age = self.tracker.progress_age(pane_id, agent.mode);
                let alive = self.tracker.is_alive(pane_id);
                let progressing =
                    alive && progress_age.is_some_and(|age| age < stuck_threshold);

                if record.circuit_open(now) {
                    if progressing {
                        info!(event = "engine.recovery.circuit_closed", pane_id = %pane_id);
                        record.reset(backoff_initial);
                    }
                    Action::Nothing
                } else if let Some(due) = record.restart_due {
                    if now >= due {
                        record.restart_due = None;
                        Action::Restart
                    } else {
                        Action::Nothing
                    }
                } else if !alive {
                    // Exit handler owns dead panes.
                    Action::Nothing
                } else if progressing {
                    if record.step != RecoveryStep::None || record.stuck_count > 0 {
                        debug!(event = "engine.recovery.progress_observed", pane_id = %pane_id);
                        record.reset(backoff_initial);
                    }
                    Action::Nothing
                } else if record.attempt_allowed(stuck_threshold, now) {
                    let step = record.step.next();

                    if step == RecoveryStep::Restart
                        && record.step == RecoveryStep::Restart
                    {
                        record.restart_failures += 1;
                        if record.restart_failures
                            >= self.config.circuit_failure_limit
                        {
                            let cooldown =
                                Duration::from_secs(self.config.circuit_cooldown_secs);
                            record.circuit_open_until = Some(now + cooldown);
                            record.restart_failures = 0;
                            error!(
                                event = "engine.recovery.circuit_opened",
                                pane_id = %pane_id,
                                role = %agent.role,
                                cooldown_secs = self.config.circuit_cooldown_secs,
                            );
                            self.sink.emit(ActivityEvent {
                                action: "recovery_alert",
                                recipients: vec![agent.role.clone()],
                                preview: format!(
                                    "recovery circuit opened for pane {}",
                                    pane_id
                                ),
                                sender_role: None,
                                mode: Some(agent.mode),
                                delivery_id: None,
                            });
                            continue;
                        }
                    }

                    record.step = step;
                    record.stuck_count += 1;
                    record.last_attempt = Some(now);
                    record.recovering = true;
                    if step == RecoveryStep::Restart {
                        record.double_backoff(Duration::from_millis(
                            self.config.backoff_cap_ms,
                        ));
                    }
                    Action::Escalate(step)
                } else {
                    Action::Nothing
                }
            };

            match action {
                Action::Nothing => {}
                Action::Restart => {
                    if let Err(e) = self.respawn(agent).await {
                        warn!(
                            event = "engine.recovery.restart_failed",
                            pane_id = %pane_id,
                            error = %e,
                        );
                    }
                }
                Action::Escalate(step) => self.escalate(agent, step).await,
            }
        }
    }

    async fn escalate(&self, agent: &AgentConfig, step: RecoveryStep) {
        let pane_id = agent.pane_id;
        info!(
            event = "engine.recovery.escalate",
            pane_id = %pane_id,
            role = %agent.role,
            step = %step,
        );

        match step {
            RecoveryStep::None => {}
            RecoveryStep::Nudge => {
                // Queued through the normal injection path, not bypassing
                // the global slot. An in-flight nudge does not block a later
                // interrupt — the next window escalates regardless.
                let outcome_future = self.injector.submit(InjectionRequest {
                    pane_id,
                    mode: agent.mode,
                    text: self.config.nudge_text.clone(),
                    delivery_id: DeliveryId::new(uuid::Uuid::new_v4().to_string()),
                    banner: None,
                });
                tokio::spawn(async move {
                    let outcome = outcome_future.await;
                    debug!(
                        event = "engine.recovery.nudge_completed",
                        pane_id = %pane_id,
                        outcome = ?outcome,
                    );
                });
            }
            RecoveryStep::Interrupt => {
                // Cancel whatever the injector has in flight for this pane
                // before sending the interrupt byte.
                self.injector.cancel_inflight(pane_id);
                if let Err(e) = self.client.interrupt(pane_id).await {
                    warn!(
                        event = "engine.recovery.interrupt_failed",
                        pane_id = %pane_id,
                        error = %e,
                    );
                }
            }
            RecoveryStep::Restart => {
                if let Err(e) = self.restart(agent).await {
                    warn!(
                        event = "engine.recovery.restart_failed",
                        pane_id = %agent.pane_id,
                        error = %e,
                    );
                }
            }
        }
    }

    /// Kill (expected) then respawn with the last known cwd and, when
    /// available, the captured session id.
    async fn restart(&self, agent: &AgentConfig) -> Result<(), EngineError> {
        let pane_id = agent.pane_id;
        info!(event = "engine.recovery.restart_started", pane_id = %pane_id);

        if let Err(e) = self.client.kill(pane_id, true).await {
            // A pane that died under us is fine — respawn anyway.
            debug!(
                event = "engine.recovery.restart_kill_skipped",
                pane_id = %pane_id,
                error = %e,
            );
        }

        // The exit propagates through the daemon asynchronously; spawning
        // into a still-live slot would fail with AlreadySpawned.
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.tracker.is_alive(pane_id) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.respawn(agent).await
    }

    async fn respawn(&self, agent: &AgentConfig) -> Result<(), EngineError> {
        let pane_id = agent.pane_id;

        // Last persisted cwd/session seed the new child.
        let entry = self
            .client
            .get_session(Some(pane_id))
            .await
            .ok()
            .and_then(|entries| entries.into_iter().next());
        let cwd = entry
            .as_ref()
            .map(|e| e.cwd.clone())
            .unwrap_or_else(|| agent.cwd.clone());
        let session_id = entry.and_then(|e| e.session_id);

        let argv = agent.respawn_argv(session_id.as_deref());
        self.client
            .spawn(pane_id, &cwd, agent.mode, argv, self.dry_run)
            .await?;
        // Re-attach: the fresh pane record starts with no attached clients.
        self.client.attach(pane_id).await?;

        info!(
            event = "engine.recovery.respawn_completed",
            pane_id = %pane_id,
            role = %agent.role,
            resumed_session = session_id.is_some(),
        );
        Ok(())
    }

    // --- Public queries / operator controls ---

    /// Per-agent health snapshot for dashboards and the CLI.
    pub fn agent_health(&self) -> Vec<AgentHealth> {
        let now = Instant::now();
        let records = self.lock_records();
        self.roster
            .agents()
            .iter()
            .map(|agent| {
                let record = records.get(&agent.pane_id);
                AgentHealth {
                    pane_id: agent.pane_id,
                    role: agent.role.clone(),
                    alive: self.tracker.is_alive(agent.pane_id),
                    last_activity_secs: self
                        .tracker
                        .progress_age(agent.pane_id, agent.mode)
                        .map(|age| age.as_secs()),
                    stuck_count: record.map_or(0, |r| r.stuck_count),
                    step: record.map_or(RecoveryStep::None, |r| r.step),
                    recovering: record.is_some_and(|r| r.recovering),
                    circuit_open: record.is_some_and(|r| r.circuit_open(now)),
                }
            })
            .collect()
    }

    /// Operator override: escalate a pane now, ignoring the timing gates.
    pub async fn trigger_recovery(&self, pane_id: PaneId) -> Result<(), EngineError> {
        let agent = self
            .roster
            .agent_for_pane(pane_id)
            .ok_or(EngineError::UnknownPane(pane_id))?;

        let step = {
            let backoff_initial = Duration::from_millis(self.config.backoff_initial_ms);
            let mut records = self.lock_records();
            let record = records
                .entry(pane_id)
                .or_insert_with(|| RecoveryRecord::new(backoff_initial));
            let step = record.step.next();
            record.step = step;
            record.stuck_count += 1;
            record.last_attempt = Some(Instant::now());
            record.recovering = true;
            step
        };
        self.escalate(agent, step).await;
        Ok(())
    }

    /// Operator override: close a pane's circuit and clear its record.
    pub fn reset_circuit(&self, pane_id: PaneId) {
        let backoff_initial = Duration::from_millis(self.config.backoff_initial_ms);
        let mut records = self.lock_records();
        if let Some(record) = records.get_mut(&pane_id) {
            record.reset(backoff_initial);
            info!(event = "engine.recovery.circuit_reset", pane_id = %pane_id);
        }
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<PaneId, RecoveryRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

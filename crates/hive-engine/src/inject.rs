//! Injection engine: delivers a text payload into one agent's input and
//! ensures it is actually submitted, not just typed.
//!
//! All panes share a single worker task, so at most one injection is ever in
//! flight globally and jobs complete in FIFO order per recipient. The worker
//! runs the full protocol for each job — idle gate, kill-line, payload,
//! adaptive delay, trusted submit, verification with retries — before
//! releasing the slot.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use hive_protocol::{AgentMode, DeliveryId, PaneId};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::DaemonClient;
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::tracker::PaneTracker;

/// ASCII NAK — the terminal "kill line" control (CTRL-U equivalent),
/// defeating accumulation from a previously-failed injection.
const KILL_LINE: u8 = 0x15;

/// Terminal result of one injection job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionOutcome {
    /// Payload written and submit verified against new output.
    Delivered,
    /// Payload written and submitted, but verification stayed ambiguous.
    DeliveredUnverified,
    /// Hard failure — the payload cannot be assumed submitted.
    Failed(InjectionFailure),
    /// The job hit its hard ceiling. Reported as success-but-unverified
    /// upstream so retry layers don't double-send.
    TimedOut,
}

impl InjectionOutcome {
    /// Whether upstream delivery tracking should record an ack.
    pub fn acked(&self) -> bool {
        matches!(
            self,
            InjectionOutcome::Delivered
                | InjectionOutcome::DeliveredUnverified
                | InjectionOutcome::TimedOut
        )
    }
}

/// Failure reasons for `InjectionOutcome::Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionFailure {
    MissingInput,
    FocusFailed,
    EnterFailed,
    VerificationFailed,
    /// Canceled by a recovery interrupt while in flight.
    Canceled,
}

impl InjectionFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            InjectionFailure::MissingInput => "missing_input",
            InjectionFailure::FocusFailed => "focus_failed",
            InjectionFailure::EnterFailed => "enter_failed",
            InjectionFailure::VerificationFailed => "verification_failed",
            InjectionFailure::Canceled => "canceled",
        }
    }
}

/// Opaque handle to whatever UI element held focus before an injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FocusToken(pub u64);

/// Capabilities the host runtime supplies to the engine.
///
/// Input focus and trusted key events are properties of the host, not of the
/// engine; a headless host uses the defaults, a GUI host overrides them.
pub trait HostHooks: Send + Sync + 'static {
    /// When a human last typed into a non-terminal input. `None` = never.
    fn last_human_input(&self) -> Option<Instant> {
        None
    }

    fn save_focus(&self) -> Option<FocusToken> {
        None
    }

    fn restore_focus(&self, _token: FocusToken) {}

    /// Authorize (or re-lock) the input path for the engine's one submit key.
    fn set_input_bypass(&self, _enabled: bool) {}

    /// Dispatch a trusted submit event for the pane.
    ///
    /// `Ok(true)` — the host dispatched it. `Ok(false)` — no host capability;
    /// the engine falls back to writing CR to the pane's stdin.
    fn submit_enter(&self, _pane_id: PaneId) -> BoxFuture<'_, Result<bool, EngineError>> {
        Box::pin(async { Ok(false) })
    }
}

/// Headless default: no focus, no typing, CR-fallback submit.
pub struct NoopHooks;

impl HostHooks for NoopHooks {}

/// One payload to deliver.
#[derive(Debug, Clone)]
pub struct InjectionRequest {
    pub pane_id: PaneId,
    pub mode: AgentMode,
    pub text: String,
    pub delivery_id: DeliveryId,
    /// One-time identity banner prefixed to the first exec submission for
    /// this pane.
    pub banner: Option<String>,
}

struct Job {
    req: InjectionRequest,
    result_tx: oneshot::Sender<InjectionOutcome>,
    cancel: CancellationToken,
    enqueued_at: Instant,
}

type InflightSlot = Arc<Mutex<Option<(PaneId, CancellationToken)>>>;

/// Handle to the injection worker. Cheap to clone.
#[derive(Clone)]
pub struct InjectionEngine {
    jobs_tx: mpsc::UnboundedSender<Job>,
    inflight: InflightSlot,
}

impl InjectionEngine {
    /// Start the worker task and return the handle.
    pub fn start(
        config: EngineConfig,
        client: Arc<DaemonClient>,
        tracker: PaneTracker,
        hooks: Arc<dyn HostHooks>,
        shutdown: CancellationToken,
    ) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let inflight: InflightSlot = Arc::new(Mutex::new(None));

        let worker = Worker {
            config,
            client,
            tracker,
            hooks,
            inflight: Arc::clone(&inflight),
            banner_sent: HashSet::new(),
        };
        tokio::spawn(worker.run(jobs_rx, shutdown));

        Self { jobs_tx, inflight }
    }

    /// Enqueue a payload; the returned future resolves with the outcome.
    pub fn submit(
        &self,
        req: InjectionRequest,
    ) -> impl std::future::Future<Output = InjectionOutcome> + Send + 'static {
        let (result_tx, result_rx) = oneshot::channel();
        let job = Job {
            req,
            result_tx,
            cancel: CancellationToken::new(),
            enqueued_at: Instant::now(),
        };
        let enqueued = self.jobs_tx.send(job).is_ok();
        async move {
            if !enqueued {
                return InjectionOutcome::Failed(InjectionFailure::Canceled);
            }
            result_rx
                .await
                .unwrap_or(InjectionOutcome::Failed(InjectionFailure::Canceled))
        }
    }

    /// Cancel the in-flight injection for a pane, if any.
    ///
    /// Only the recovery manager calls this, alongside `interrupt(pane)`.
    /// Text already written is not undone.
    pub fn cancel_inflight(&self, pane_id: PaneId) {
        let slot = match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((inflight_pane, token)) = slot.as_ref()
            && *inflight_pane == pane_id
        {
            info!(event = "engine.inject.cancel_inflight", pane_id = %pane_id);
            token.cancel();
        }
    }
}

struct Worker {
    config: EngineConfig,
    client: Arc<DaemonClient>,
    tracker: PaneTracker,
    hooks: Arc<dyn HostHooks>,
    inflight: InflightSlot,
    banner_sent: HashSet<PaneId>,
}

impl Worker {
    async fn run(mut self, mut jobs_rx: mpsc::UnboundedReceiver<Job>, shutdown: CancellationToken) {
        loop {
            let job = tokio::select! {
                job = jobs_rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };

            let pane_id = job.req.pane_id;
            let delivery_id = job.req.delivery_id.clone();
            let queued_for = job.enqueued_at.elapsed();
            self.set_inflight(Some((pane_id, job.cancel.clone())));

            debug!(
                event = "engine.inject.job_started",
                pane_id = %pane_id,
                delivery_id = %delivery_id,
                queued_ms = queued_for.as_millis() as u64,
            );

            let ceiling = Duration::from_millis(self.config.job_ceiling_ms);
            let outcome = tokio::select! {
                result = tokio::time::timeout(ceiling, self.run_job(&job.req)) => {
                    match result {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            warn!(
                                event = "engine.inject.job_ceiling_hit",
                                pane_id = %pane_id,
                                delivery_id = %delivery_id,
                            );
                            InjectionOutcome::TimedOut
                        }
                    }
                }
                _ = job.cancel.cancelled() => {
                    InjectionOutcome::Failed(InjectionFailure::Canceled)
                }
            };

            self.set_inflight(None);

            info!(
                event = "engine.inject.job_completed",
                pane_id = %pane_id,
                delivery_id = %delivery_id,
                outcome = ?outcome,
            );
            let _ = job.result_tx.send(outcome);
        }
    }

    fn set_inflight(&self, value: Option<(PaneId, CancellationToken)>) {
        let mut slot = match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = value;
    }

    async fn run_job(&mut self, req: &InjectionRequest) -> InjectionOutcome {
        match req.mode {
            AgentMode::Interactive => self.run_interactive(req).await,
            AgentMode::Exec => self.run_exec(req).await,
            _ => self.run_exec(req).await,
        }
    }

    // --- Interactive protocol ---

    async fn run_interactive(&self, req: &InjectionRequest) -> InjectionOutcome {
        let pane_id = req.pane_id;
        self.typing_guard_wait().await;
        self.preflight_idle_wait(pane_id).await;

        // Clear the input line, then type the payload. No trailing newline:
        // TUIs ignore raw newlines as submit.
        if let Err(e) = self.client.write_bytes(pane_id, &[KILL_LINE]).await {
            warn!(event = "engine.inject.kill_line_failed", pane_id = %pane_id, error = %e);
            return InjectionOutcome::Failed(InjectionFailure::MissingInput);
        }
        if let Err(e) = self.client.write_bytes(pane_id, req.text.as_bytes()).await {
            warn!(event = "engine.inject.write_failed", pane_id = %pane_id, error = %e);
            return InjectionOutcome::Failed(InjectionFailure::MissingInput);
        }

        tokio::time::sleep(self.adaptive_submit_delay(pane_id)).await;

        let mut saw_output = false;
        for attempt in 0..self.config.verify_retries {
            let mark = self.tracker.output_marker(pane_id);

            if let Err(failure) = self.dispatch_submit(pane_id).await {
                return InjectionOutcome::Failed(failure);
            }

            match self.verify(pane_id, mark).await {
                Verification::Verified => return InjectionOutcome::Delivered,
                Verification::OutputOnly => {
                    saw_output = true;
                }
                Verification::Silent => {}
            }

            debug!(
                event = "engine.inject.verify_retry",
                pane_id = %pane_id,
                attempt = attempt + 1,
                saw_output = saw_output,
            );
            tokio::time::sleep(Duration::from_millis(self.config.verify_retry_interval_ms))
                .await;
        }

        if saw_output {
            // Output moved but no prompt marker: report ambiguity upstream
            // instead of risking a double-send.
            InjectionOutcome::DeliveredUnverified
        } else {
            InjectionOutcome::Failed(InjectionFailure::EnterFailed)
        }
    }

    /// Cooperative deferral while a human is typing; bounded, then inject
    /// anyway.
    async fn typing_guard_wait(&self) {
        let window = Duration::from_millis(self.config.typing_guard_window_ms);
        let max_defer = Duration::from_millis(self.config.typing_guard_max_defer_ms);
        let started = Instant::now();

        loop {
            let Some(last_input) = self.hooks.last_human_input() else {
                return;
            };
            if last_input.elapsed() >= window {
                return;
            }
            if started.elapsed() >= max_defer {
                debug!(event = "engine.inject.typing_guard_expired");
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Wait (bounded) for the target to go quiescent. Injecting into an
    /// actively-redrawing TUI often drops the submit key.
    async fn preflight_idle_wait(&self, pane_id: PaneId) {
        let idle = Duration::from_millis(self.config.idle_threshold_ms);
        let deadline = Instant::now() + Duration::from_millis(self.config.preflight_wait_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        while Instant::now() < deadline {
            match self.tracker.last_output_age(pane_id) {
                Some(age) if age < idle => tokio::time::sleep(poll).await,
                _ => return,
            }
        }
        debug!(event = "engine.inject.idle_gate_expired", pane_id = %pane_id);
    }

    /// Submit delay from last-output recency: idle targets accept the key
    /// quickly, busy ones need the render loop to settle.
    fn adaptive_submit_delay(&self, pane_id: PaneId) -> Duration {
        let age = self.tracker.last_output_age(pane_id);
        let ms = match age {
            None => self.config.submit_delay_idle_ms,
            Some(age) if age > Duration::from_millis(self.config.idle_threshold_ms) => {
                self.config.submit_delay_idle_ms
            }
            Some(age) if age > Duration::from_millis(100) => self.config.submit_delay_active_ms,
            Some(_) => self.config.submit_delay_busy_ms,
        };
        Duration::from_millis(ms)
    }

    /// Dispatch the trusted Enter, with the input-lock bypass held open only
    /// for the dispatch window and focus restored unconditionally.
    async fn dispatch_submit(&self, pane_id: PaneId) -> Result<(), InjectionFailure> {
        let focus = self.hooks.save_focus();
        self.hooks.set_input_bypass(true);

        let submit_result = self.hooks.submit_enter(pane_id).await;

        tokio::time::sleep(Duration::from_millis(self.config.bypass_clear_ms)).await;
        self.hooks.set_input_bypass(false);
        if let Some(token) = focus {
            self.hooks.restore_focus(token);
        }

        match submit_result {
            Ok(true) => Ok(()),
            Ok(false) => {
                // No host capability: fall back to CR on the pane's stdin.
                self.client
                    .write_bytes(pane_id, b"\r")
                    .await
                    .map_err(|e| {
                        warn!(
                            event = "engine.inject.enter_write_failed",
                            pane_id = %pane_id,
                            error = %e,
                        );
                        InjectionFailure::EnterFailed
                    })
            }
            Err(e) => {
                warn!(event = "engine.inject.submit_enter_failed", pane_id = %pane_id, error = %e);
                Err(InjectionFailure::EnterFailed)
            }
        }
    }

    /// Poll for post-submit output: success is new output plus a
    /// prompt-ready marker, or sustained output across polls.
    async fn verify(&self, pane_id: PaneId, mark: u64) -> Verification {
        let deadline = Instant::now() + Duration::from_millis(self.config.verify_window_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let mut last_bytes = 0u64;
        let mut growth_ticks = 0u32;

        while Instant::now() < deadline {
            let bytes = self.tracker.bytes_since(pane_id, mark);
            if bytes > 0 {
                if self.tracker.prompt_ready(pane_id) {
                    return Verification::Verified;
                }
                if bytes > last_bytes {
                    growth_ticks += 1;
                    last_bytes = bytes;
                }
                if growth_ticks >= 2 {
                    // Sustained output: the agent is visibly processing it.
                    return Verification::Verified;
                }
            }
            tokio::time::sleep(poll).await;
        }

        if last_bytes > 0 {
            Verification::OutputOnly
        } else {
            Verification::Silent
        }
    }

    // --- Exec protocol ---

    /// Route the payload to the child's stdin as a single request line.
    /// No synthetic Enter; verification reduces to "accepted by child".
    async fn run_exec(&mut self, req: &InjectionRequest) -> InjectionOutcome {
        let pane_id = req.pane_id;

        let mut payload = String::new();
        if let Some(banner) = &req.banner
            && self.banner_sent.insert(pane_id)
        {
            payload.push_str(banner);
            payload.push('\n');
        }
        payload.push_str(&req.text);
        if !payload.ends_with('\n') {
            payload.push('\n');
        }

        if let Err(e) = self.client.write_bytes(pane_id, payload.as_bytes()).await {
            warn!(event = "engine.inject.exec_write_failed", pane_id = %pane_id, error = %e);
            return InjectionOutcome::Failed(InjectionFailure::MissingInput);
        }

        // Grace window: a child that dies on the request did not accept it.
        tokio::time::sleep(Duration::from_millis(self.config.exec_grace_ms)).await;
        if !self.tracker.is_alive(pane_id)
            && self
                .tracker
                .last_exit(pane_id)
                .is_some_and(|exit| exit.code != Some(0))
        {
            return InjectionOutcome::Failed(InjectionFailure::VerificationFailed);
        }

        InjectionOutcome::Delivered
    }
}

enum Verification {
    Verified,
    OutputOnly,
    Silent,
}

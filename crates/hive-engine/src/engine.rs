//! Engine assembly: wires the daemon client, pane tracker, injection
//! engine, trigger router, and recovery manager into one running unit with
//! explicit lifecycle hooks.

use std::sync::Arc;
use std::time::Duration;

use hive_paths::HivePaths;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::activity::{ActivitySink, TracingActivitySink};
use crate::client::DaemonClient;
use crate::config::HivemindConfig;
use crate::errors::EngineError;
use crate::inject::{HostHooks, InjectionEngine, NoopHooks};
use crate::recovery::{AgentHealth, RecoveryManager};
use crate::roster::Roster;
use crate::router::TriggerRouter;
use crate::tracker::PaneTracker;

/// Options for `Engine::start`.
pub struct EngineOptions {
    pub hooks: Arc<dyn HostHooks>,
    pub sink: Arc<dyn ActivitySink>,
    /// Spawn every roster pane as a dry-run mock (no real CLIs needed).
    pub dry_run: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            hooks: Arc::new(NoopHooks),
            sink: Arc::new(TracingActivitySink),
            dry_run: false,
        }
    }
}

/// The running coordination engine.
///
/// Owns the background tasks; `shutdown()` stops them and leaves the daemon
/// (and its children) running for the next host session.
pub struct Engine {
    client: Arc<DaemonClient>,
    tracker: PaneTracker,
    injector: InjectionEngine,
    router: Arc<TriggerRouter>,
    recovery: Arc<RecoveryManager>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Connect to the daemon, spawn missing roster panes, and start the
    /// router and recovery loops.
    pub async fn start(
        paths: HivePaths,
        config: HivemindConfig,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        if config.agents.is_empty() {
            return Err(EngineError::ConfigInvalid(
                "no [[agents]] configured in hivemind.toml".to_string(),
            ));
        }

        let roster = Arc::new(Roster::new(config.agents.clone(), config.groups.clone()));
        let engine_config = config.engine.clone();

        let client = Arc::new(
            DaemonClient::connect_with_retry(
                &paths.daemon_socket(),
                10,
                Duration::from_millis(300),
            )
            .await?,
        );

        let tracker = PaneTracker::new();
        tracker.observe(client.subscribe());

        // Spawn whatever the daemon isn't already running, then attach to
        // every pane so the tracker sees its output.
        let existing = client.list().await?;
        for agent in roster.agents() {
            let already_alive = existing.iter().any(|p| {
                p.pane_id == agent.pane_id
                    && matches!(
                        p.status,
                        hive_protocol::PaneStatus::Starting | hive_protocol::PaneStatus::Running
                    )
            });
            if already_alive {
                info!(
                    event = "engine.start.pane_reattached",
                    pane_id = %agent.pane_id,
                    role = %agent.role,
                );
            } else {
                client
                    .spawn(
                        agent.pane_id,
                        &agent.cwd,
                        agent.mode,
                        agent.argv.clone(),
                        options.dry_run,
                    )
                    .await?;
                info!(
                    event = "engine.start.pane_spawned",
                    pane_id = %agent.pane_id,
                    role = %agent.role,
                    dry_run = options.dry_run,
                );
            }
            client.attach(agent.pane_id).await?;
        }

        let shutdown = CancellationToken::new();

        let injector = InjectionEngine::start(
            engine_config.clone(),
            Arc::clone(&client),
            tracker.clone(),
            options.hooks,
            shutdown.clone(),
        );

        let router = Arc::new(TriggerRouter::new(
            paths,
            engine_config.clone(),
            Arc::clone(&roster),
            injector.clone(),
            Arc::clone(&options.sink),
        )?);
        let router_task = Arc::clone(&router);
        let router_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = router_task.run(router_shutdown).await {
                warn!(event = "engine.router.stopped", error = %e);
            }
        });

        let recovery = Arc::new(RecoveryManager::new(
            engine_config,
            roster,
            Arc::clone(&client),
            tracker.clone(),
            injector.clone(),
            options.sink,
            options.dry_run,
        ));
        tokio::spawn(Arc::clone(&recovery).run(shutdown.clone()));

        info!(event = "engine.start.completed");

        Ok(Self {
            client,
            tracker,
            injector,
            router,
            recovery,
            shutdown,
        })
    }

    pub fn client(&self) -> &Arc<DaemonClient> {
        &self.client
    }

    pub fn tracker(&self) -> &PaneTracker {
        &self.tracker
    }

    pub fn injector(&self) -> &InjectionEngine {
        &self.injector
    }

    pub fn router(&self) -> &Arc<TriggerRouter> {
        &self.router
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    /// Per-agent health snapshot.
    pub fn agent_health(&self) -> Vec<AgentHealth> {
        self.recovery.agent_health()
    }

    /// Stop the engine's background tasks. The daemon keeps running.
    pub fn shutdown(&self) {
        info!(event = "engine.shutdown_started");
        self.shutdown.cancel();
    }
}

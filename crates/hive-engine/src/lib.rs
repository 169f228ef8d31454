//! hive-engine: the Hivemind agent coordination engine.
//!
//! Coordinates a fixed roster of co-located AI CLI agents so they can
//! exchange messages, hand off work, and recover from stalls. Three
//! subsystems over the terminal daemon:
//!
//! - [`inject`] — serialized delivery of payloads into agent inputs, with
//!   submission verification and cooperative deferral.
//! - [`router`] — the file-watch mailbox: dedup, ordering, fan-out, and
//!   delivery acknowledgement.
//! - [`recovery`] — per-agent stall detection and the nudge → interrupt →
//!   restart escalation ladder.
//!
//! Everything visual is out of scope; hosts consume events and call
//! commands through [`Engine`].

pub mod activity;
pub mod client;
pub mod config;
pub mod engine;
pub mod errors;
pub mod inject;
pub mod logging;
pub mod recovery;
pub mod roster;
pub mod router;
pub mod tracker;

pub use activity::{ActivityEvent, ActivitySink, TracingActivitySink};
pub use client::DaemonClient;
pub use config::{AgentConfig, EngineConfig, GroupConfig, HivemindConfig, load_config};
pub use engine::{Engine, EngineOptions};
pub use errors::EngineError;
pub use inject::{
    HostHooks, InjectionEngine, InjectionFailure, InjectionOutcome, InjectionRequest, NoopHooks,
};
pub use logging::init_logging;
pub use recovery::{AgentHealth, RecoveryManager, RecoveryStep};
pub use roster::Roster;
pub use router::TriggerRouter;
pub use tracker::PaneTracker;

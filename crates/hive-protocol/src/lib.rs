//! Shared IPC protocol for Hivemind daemon communication.
//!
//! Wire types (`ClientMessage`/`DaemonMessage`), domain newtypes, the JSONL
//! codec, and a synchronous Unix-socket client. The daemon server and the
//! engine's streaming client both build on this crate.

#[cfg(unix)]
pub mod client;
pub mod codec;
mod messages;
mod types;

#[cfg(unix)]
pub use client::{IpcConnection, IpcError};
pub use messages::{ClientMessage, DaemonMessage, ErrorCode, SessionEntry};
pub use types::{ActivityKind, AgentMode, DeliveryId, PaneId, PaneInfo, PaneStatus, Role};

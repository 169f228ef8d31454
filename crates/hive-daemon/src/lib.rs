//! hive-daemon: the Hivemind terminal daemon.
//!
//! Owns every agent child process (interactive PTYs, exec-mode streaming
//! children, dry-run mocks), persists pane sessions across front-end
//! restarts, and multiplexes output to IPC subscribers over a workspace
//! Unix socket.

pub mod errors;
pub mod events;
pub mod exec;
pub mod mock;
pub mod panes;
pub mod pid;
pub mod pty;
pub mod scrollback;
pub mod server;
pub mod state;
pub mod types;

// Primary re-exports
pub use errors::DaemonError;
pub use panes::{PaneManager, SpawnRequest};
pub use server::run_server;
pub use types::{DaemonConfig, load_daemon_config};

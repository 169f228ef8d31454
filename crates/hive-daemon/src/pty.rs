use std::io::Write;
use std::sync::{Arc, Mutex};

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, error, info};

use crate::errors::DaemonError;
use crate::events::OutputSinks;

/// ASCII ETX — what the terminal driver turns into SIGINT for the foreground group.
pub const INTERRUPT_BYTE: u8 = 0x03;

/// Handle to a live PTY child.
pub struct PtyPane {
    /// Master end of the PTY. Used for resize and cloning readers.
    master: Mutex<Box<dyn MasterPty + Send>>,
    /// Child process handle. Used for wait/kill.
    child: Box<dyn Child + Send + Sync>,
    /// Writer to PTY stdin. Wrapped in Arc<Mutex<>> because take_writer()
    /// can only be called once, but we need to write from multiple contexts.
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    /// Current PTY dimensions.
    size: PtySize,
}

impl PtyPane {
    /// Allocate a PTY and spawn `argv[0]` with the remaining args in it.
    pub fn spawn(
        pane_id: hive_protocol::PaneId,
        argv: &[String],
        cwd: &std::path::Path,
        rows: u16,
        cols: u16,
        env_vars: &[(String, String)],
    ) -> Result<Self, DaemonError> {
        let command = argv
            .first()
            .ok_or_else(|| DaemonError::SpawnFailed("empty argv".to_string()))?;

        let pty_system = native_pty_system();
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| DaemonError::PtyError(format!("openpty: {}", e)))?;

        let mut cmd = CommandBuilder::new(command);
        cmd.args(&argv[1..]);
        cmd.cwd(cwd);

        for (key, value) in env_vars {
            cmd.env(key, value);
        }

        info!(
            event = "daemon.pty.spawn_started",
            pane_id = %pane_id,
            command = %command,
            rows = rows,
            cols = cols,
        );

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| DaemonError::PtyError(format!("spawn: {}", e)))?;

        let pid = child.process_id();

        // Take the writer once (portable-pty only allows one take_writer call)
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| DaemonError::PtyError(format!("take writer: {}", e)))?;

        info!(
            event = "daemon.pty.spawn_completed",
            pane_id = %pane_id,
            pid = ?pid,
        );

        Ok(Self {
            master: Mutex::new(pair.master),
            child,
            writer: Arc::new(Mutex::new(writer)),
            size,
        })
    }

    pub fn size(&self) -> PtySize {
        self.size
    }

    /// Clone the PTY master reader for reading output in a background task.
    pub fn try_clone_reader(&self) -> Result<Box<dyn std::io::Read + Send>, DaemonError> {
        self.master
            .lock()
            .map_err(|e| DaemonError::PtyError(format!("lock master: {}", e)))?
            .try_clone_reader()
            .map_err(|e| DaemonError::PtyError(format!("clone reader: {}", e)))
    }

    /// Write bytes to PTY stdin.
    pub fn write_stdin(&self, data: &[u8]) -> Result<(), DaemonError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| DaemonError::PtyError(format!("lock writer: {}", e)))?;
        writer
            .write_all(data)
            .map_err(|e| DaemonError::PtyError(format!("write stdin: {}", e)))?;
        writer
            .flush()
            .map_err(|e| DaemonError::PtyError(format!("flush stdin: {}", e)))?;
        Ok(())
    }

    /// Write the interrupt byte (0x03) to PTY stdin.
    pub fn interrupt(&self) -> Result<(), DaemonError> {
        self.write_stdin(&[INTERRUPT_BYTE])
    }

    /// Resize the PTY.
    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<(), DaemonError> {
        let new_size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        self.master
            .lock()
            .map_err(|e| DaemonError::PtyError(format!("lock master: {}", e)))?
            .resize(new_size)
            .map_err(|e| DaemonError::PtyError(format!("resize: {}", e)))?;
        self.size = new_size;
        debug!(
            event = "daemon.pty.resize_completed",
            rows = rows,
            cols = cols,
        );
        Ok(())
    }

    /// Get the child process ID, if available.
    pub fn child_process_id(&self) -> Option<u32> {
        self.child.process_id()
    }

    /// Exit code if the child has already exited, without blocking.
    pub fn try_exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code() as i32),
            _ => None,
        }
    }

    /// Kill the child process.
    pub fn kill(&mut self) -> Result<(), DaemonError> {
        self.child
            .kill()
            .map_err(|e| DaemonError::PtyError(format!("kill: {}", e)))
    }
}

/// Spawn a blocking task that reads PTY output into the shared sinks.
///
/// The task exits when the PTY reader returns EOF (child process exited) or
/// on read error, then posts an internal exit notification. The exit code is
/// filled in by the manager via `try_exit_code`.
pub fn spawn_pty_reader(
    mut reader: Box<dyn std::io::Read + Send>,
    sinks: OutputSinks,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let pane_id = sinks.pane_id;
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!(event = "daemon.pty.reader_eof", pane_id = %pane_id);
                    break;
                }
                Ok(n) => {
                    sinks.feed(&buf[..n]);
                }
                Err(e) => {
                    error!(
                        event = "daemon.pty.reader_error",
                        pane_id = %pane_id,
                        error = %e,
                    );
                    break;
                }
            }
        }
        // The manager resolves the exit code; None here means "unknown yet".
        sinks.exited(None);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrollback::ScrollbackBuffer;
    use hive_protocol::{DaemonMessage, PaneId};
    use std::sync::atomic::AtomicI64;
    use tokio::sync::broadcast;

    fn test_sinks(
        pane_id: PaneId,
    ) -> (
        OutputSinks,
        broadcast::Receiver<DaemonMessage>,
        tokio::sync::mpsc::UnboundedReceiver<crate::events::PaneInternalEvent>,
    ) {
        let (events_tx, events_rx) = broadcast::channel(64);
        let (internal_tx, internal_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            OutputSinks {
                pane_id,
                events_tx,
                scrollback: Arc::new(Mutex::new(ScrollbackBuffer::new(4096))),
                last_activity: Arc::new(AtomicI64::new(0)),
                internal_tx,
            },
            events_rx,
            internal_rx,
        )
    }

    #[tokio::test]
    async fn test_spawn_write_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pane_id = PaneId::new(1);
        let pty = PtyPane::spawn(
            pane_id,
            &["/bin/cat".to_string()],
            dir.path(),
            24,
            80,
            &[],
        )
        .unwrap();

        let (sinks, mut events_rx, mut internal_rx) = test_sinks(pane_id);
        let reader = pty.try_clone_reader().unwrap();
        spawn_pty_reader(reader, sinks);

        pty.write_stdin(b"hello pty\n").unwrap();

        // cat echoes back through the PTY
        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), events_rx.recv())
            .await
            .expect("timed out waiting for PTY output")
            .unwrap();
        match msg {
            DaemonMessage::Data { data, .. } => {
                use base64::Engine;
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .unwrap();
                assert!(!decoded.is_empty());
            }
            other => panic!("expected Data, got {:?}", other),
        }

        let mut pty = pty;
        pty.kill().unwrap();

        let exit = tokio::time::timeout(std::time::Duration::from_secs(5), internal_rx.recv())
            .await
            .expect("timed out waiting for exit event");
        assert!(exit.is_some());
    }

    #[tokio::test]
    async fn test_spawn_empty_argv_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = PtyPane::spawn(PaneId::new(1), &[], dir.path(), 24, 80, &[]);
        assert!(matches!(result, Err(DaemonError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_resize_updates_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut pty = PtyPane::spawn(
            PaneId::new(2),
            &["/bin/cat".to_string()],
            dir.path(),
            24,
            80,
            &[],
        )
        .unwrap();

        pty.resize(40, 120).unwrap();
        assert_eq!(pty.size().rows, 40);
        assert_eq!(pty.size().cols, 120);

        pty.kill().unwrap();
    }
}

//! Exec-mode agent backend: a child process without a PTY whose stdout is a
//! structured NDJSON event stream.

pub mod protocol;

use std::process::Stdio;

use hive_protocol::PaneId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::DaemonError;
use crate::events::{OutputSinks, PaneInternalEvent};
use protocol::{ExecSignal, classify_line, sanitize_text};

/// Handle to a live exec-mode child.
///
/// The child itself is owned by a supervisor task; this handle exposes a
/// stdin channel and a kill token. `interrupt` is a documented no-op for
/// exec panes (there is no terminal driver to translate 0x03).
pub struct ExecPane {
    stdin_tx: mpsc::UnboundedSender<Vec<u8>>,
    kill: CancellationToken,
    pid: Option<u32>,
}

impl ExecPane {
    /// Spawn the exec child and its supervisor tasks.
    pub fn spawn(
        pane_id: PaneId,
        argv: &[String],
        cwd: &std::path::Path,
        env_vars: &[(String, String)],
        sinks: OutputSinks,
    ) -> Result<Self, DaemonError> {
        let command = argv
            .first()
            .ok_or_else(|| DaemonError::SpawnFailed("empty argv".to_string()))?;

        let mut cmd = Command::new(command);
        cmd.args(&argv[1..])
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env_vars {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| DaemonError::SpawnFailed(format!("{}: {}", command, e)))?;

        let pid = child.id();
        info!(
            event = "daemon.exec.spawn_completed",
            pane_id = %pane_id,
            command = %command,
            pid = ?pid,
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DaemonError::SpawnFailed("no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DaemonError::SpawnFailed("no stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DaemonError::SpawnFailed("no stderr pipe".to_string()))?;

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let kill = CancellationToken::new();

        // Writer task: owns the stdin pipe.
        let mut stdin_writer = stdin;
        tokio::spawn(async move {
            while let Some(data) = stdin_rx.recv().await {
                if stdin_writer.write_all(&data).await.is_err() {
                    break;
                }
                if stdin_writer.flush().await.is_err() {
                    break;
                }
            }
        });

        // Stderr task: sanitize, log, forward to subscribers.
        let stderr_sinks = sinks.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let clean = sanitize_text(&line);
                if clean.is_empty() {
                    continue;
                }
                warn!(
                    event = "daemon.exec.stderr",
                    pane_id = %stderr_sinks.pane_id,
                    line = %clean,
                );
                stderr_sinks.feed(format!("{}\n", clean).as_bytes());
            }
        });

        // Supervisor task: owns the child, parses stdout, reports exit.
        let token = kill.clone();
        tokio::spawn(async move {
            let pane_id = sinks.pane_id;
            let mut lines = BufReader::new(stdout).lines();
            let mut killed = false;

            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => handle_stdout_line(&line, &sinks),
                            Ok(None) => {
                                debug!(event = "daemon.exec.stdout_eof", pane_id = %pane_id);
                                break;
                            }
                            Err(e) => {
                                warn!(
                                    event = "daemon.exec.stdout_read_error",
                                    pane_id = %pane_id,
                                    error = %e,
                                );
                                break;
                            }
                        }
                    }
                    _ = token.cancelled() => {
                        killed = true;
                        break;
                    }
                }
            }

            if killed && let Err(e) = child.kill().await {
                warn!(
                    event = "daemon.exec.kill_failed",
                    pane_id = %pane_id,
                    error = %e,
                );
            }

            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(
                        event = "daemon.exec.wait_failed",
                        pane_id = %pane_id,
                        error = %e,
                    );
                    None
                }
            };

            debug!(event = "daemon.exec.child_exited", pane_id = %pane_id, code = ?code);
            sinks.exited(code);
        });

        Ok(Self {
            stdin_tx,
            kill,
            pid,
        })
    }

    /// Queue bytes for the child's stdin.
    pub fn write_stdin(&self, pane_id: PaneId, data: &[u8]) -> Result<(), DaemonError> {
        self.stdin_tx
            .send(data.to_vec())
            .map_err(|_| DaemonError::NotAlive(pane_id))
    }

    /// Request child termination. The supervisor task reports the exit.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Sanitize, classify, and forward one stdout line.
fn handle_stdout_line(line: &str, sinks: &OutputSinks) {
    let clean = sanitize_text(line);

    match classify_line(&clean) {
        ExecSignal::Session(session_id) => {
            let _ = sinks
                .internal_tx
                .send(PaneInternalEvent::SessionCaptured {
                    pane_id: sinks.pane_id,
                    session_id,
                });
        }
        ExecSignal::Activity(kind) => sinks.activity(kind),
        ExecSignal::Silent => {}
    }

    sinks.feed(format!("{}\n", clean).as_bytes());
}

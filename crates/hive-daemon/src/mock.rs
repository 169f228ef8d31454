//! Dry-run pane backend: no child process, canned responses.
//!
//! Used by `spawn{dry_run:true}` so the engine and tests can exercise the
//! full injection/verify path without a real agent CLI installed.

use hive_protocol::PaneId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::DaemonError;
use crate::events::OutputSinks;

/// The reply a mock pane prints after every input chunk.
const CANNED_RESPONSE: &str = "ack: dry-run agent received input";

/// Prompt marker rendered after every response, mirroring what interactive
/// TUIs print when ready for input.
const PROMPT: &str = "\u{276f} ";

pub struct MockPane {
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    kill: CancellationToken,
}

impl MockPane {
    pub fn spawn(pane_id: PaneId, sinks: OutputSinks) -> Self {
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let kill = CancellationToken::new();
        let token = kill.clone();

        tokio::spawn(async move {
            sinks.activity(hive_protocol::ActivityKind::Ready);
            sinks.feed(PROMPT.as_bytes());

            loop {
                tokio::select! {
                    chunk = input_rx.recv() => {
                        match chunk {
                            Some(data) => {
                                // Echo the input like a terminal would.
                                sinks.feed(&data);
                                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
                                sinks.feed(format!("\r\n{}\r\n{}", CANNED_RESPONSE, PROMPT).as_bytes());
                            }
                            None => break,
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }

            debug!(event = "daemon.mock.stopped", pane_id = %pane_id);
            sinks.exited(Some(0));
        });

        Self { input_tx, kill }
    }

    pub fn write_stdin(&self, pane_id: PaneId, data: &[u8]) -> Result<(), DaemonError> {
        self.input_tx
            .send(data.to_vec())
            .map_err(|_| DaemonError::NotAlive(pane_id))
    }

    pub fn kill(&self) {
        self.kill.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PaneInternalEvent;
    use crate::scrollback::ScrollbackBuffer;
    use base64::Engine;
    use hive_protocol::{ActivityKind, DaemonMessage};
    use std::sync::atomic::AtomicI64;
    use std::sync::{Arc, Mutex};
    use tokio::sync::broadcast;

    fn test_sinks(
        pane_id: PaneId,
    ) -> (
        OutputSinks,
        broadcast::Receiver<DaemonMessage>,
        mpsc::UnboundedReceiver<PaneInternalEvent>,
    ) {
        let (events_tx, events_rx) = broadcast::channel(64);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
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

    async fn next_data(rx: &mut broadcast::Receiver<DaemonMessage>) -> Vec<u8> {
        loop {
            match tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for mock output")
                .unwrap()
            {
                DaemonMessage::Data { data, .. } => {
                    return base64::engine::general_purpose::STANDARD
                        .decode(data)
                        .unwrap();
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_mock_emits_ready_and_prompt_on_spawn() {
        let pane_id = PaneId::new(1);
        let (sinks, mut rx, _internal) = test_sinks(pane_id);
        let _pane = MockPane::spawn(pane_id, sinks);

        let first = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            first,
            DaemonMessage::Activity {
                kind: ActivityKind::Ready,
                ..
            }
        ));

        let prompt = next_data(&mut rx).await;
        assert_eq!(String::from_utf8_lossy(&prompt), PROMPT);
    }

    #[tokio::test]
    async fn test_mock_echoes_and_responds() {
        let pane_id = PaneId::new(2);
        let (sinks, mut rx, _internal) = test_sinks(pane_id);
        let pane = MockPane::spawn(pane_id, sinks);

        // Skip the ready activity + initial prompt.
        let _ = next_data(&mut rx).await;

        pane.write_stdin(pane_id, b"do the thing").unwrap();

        let echo = next_data(&mut rx).await;
        assert_eq!(echo, b"do the thing");

        let response = next_data(&mut rx).await;
        let text = String::from_utf8_lossy(&response).to_string();
        assert!(text.contains(CANNED_RESPONSE));
        assert!(text.contains(PROMPT));
    }

    #[tokio::test]
    async fn test_mock_kill_reports_clean_exit() {
        let pane_id = PaneId::new(3);
        let (sinks, _rx, mut internal) = test_sinks(pane_id);
        let pane = MockPane::spawn(pane_id, sinks);

        pane.kill();

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), internal.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            PaneInternalEvent::Exited { code, .. } => assert_eq!(code, Some(0)),
            other => panic!("expected Exited, got {:?}", other),
        }
    }
}

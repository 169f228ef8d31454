//! Integration tests for the hive-daemon client-server roundtrip.
//!
//! These tests start a real server on a temp socket, connect over the JSONL
//! protocol, and exercise spawn/write/attach/kill plus session persistence.
//! Agent children are dry-run mocks so no real CLI is required.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use hive_daemon::types::DaemonConfig;
use hive_protocol::codec::{read_message, write_message};
use hive_protocol::{AgentMode, ClientMessage, DaemonMessage, ErrorCode, PaneId};
use tokio::io::BufReader;
use tokio::net::UnixStream;

/// Create a DaemonConfig pointing at a temp directory for test isolation.
fn test_config(dir: &std::path::Path) -> DaemonConfig {
    DaemonConfig {
        socket_path: dir.join("daemon.sock"),
        pid_path: dir.join("daemon.pid"),
        session_state_path: dir.join("session-state.json"),
        scrollback_buffer_size: 4096,
        persisted_scrollback_bytes: 1024,
        snapshot_interval_secs: 30,
        shutdown_timeout_secs: 2,
        default_rows: 24,
        default_cols: 80,
    }
}

/// Minimal async JSONL client for tests.
struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
    next_id: u32,
}

impl TestClient {
    async fn connect(socket_path: &std::path::Path) -> Self {
        let stream = UnixStream::connect(socket_path).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            next_id: 1,
        };
        // Consume the greeting.
        let greeting = client.next_message().await;
        assert!(matches!(greeting, DaemonMessage::Connected { .. }));
        client
    }

    fn id(&mut self) -> String {
        let id = format!("req-{}", self.next_id);
        self.next_id += 1;
        id
    }

    async fn next_message(&mut self) -> DaemonMessage {
        tokio::time::timeout(Duration::from_secs(5), async {
            read_message::<_, DaemonMessage>(&mut self.reader)
                .await
                .unwrap()
                .expect("connection closed")
        })
        .await
        .expect("timed out waiting for daemon message")
    }

    /// Send a request and read messages until the correlated response arrives.
    async fn request(&mut self, msg: ClientMessage) -> DaemonMessage {
        let id = msg.id().to_string();
        write_message(&mut self.writer, &msg).await.unwrap();
        loop {
            let response = self.next_message().await;
            if response.response_id() == Some(id.as_str()) {
                return response;
            }
        }
    }

    /// Read pushed messages until one matches the predicate.
    async fn wait_for(&mut self, mut pred: impl FnMut(&DaemonMessage) -> bool) -> DaemonMessage {
        loop {
            let msg = self.next_message().await;
            if pred(&msg) {
                return msg;
            }
        }
    }
}

fn dry_spawn(id: String, pane: u32, cwd: &std::path::Path) -> ClientMessage {
    ClientMessage::Spawn {
        id,
        pane_id: PaneId::new(pane),
        cwd: cwd.to_string_lossy().to_string(),
        mode: AgentMode::Interactive,
        argv: vec!["claude".to_string()],
        dry_run: true,
        env: HashMap::new(),
        rows: None,
        cols: None,
    }
}

#[tokio::test]
async fn test_ping_and_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let socket_path = config.socket_path.clone();

    let server_handle = tokio::spawn(async move { hive_daemon::run_server(config).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = TestClient::connect(&socket_path).await;

    let id = client.id();
    let pong = client.request(ClientMessage::Ping { id }).await;
    assert!(matches!(pong, DaemonMessage::Pong { .. }));

    let id = client.id();
    let ack = client.request(ClientMessage::Shutdown { id }).await;
    assert!(matches!(ack, DaemonMessage::Ack { .. }));

    let result = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
    assert!(result.is_ok(), "server should exit after shutdown command");
}

#[tokio::test]
async fn test_spawn_list_kill_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let socket_path = config.socket_path.clone();

    let server_handle = tokio::spawn(async move { hive_daemon::run_server(config).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = TestClient::connect(&socket_path).await;

    let id = client.id();
    let spawned = client.request(dry_spawn(id, 1, dir.path())).await;
    match &spawned {
        DaemonMessage::Spawned { pane_id, mode, .. } => {
            assert_eq!(*pane_id, PaneId::new(1));
            assert_eq!(*mode, AgentMode::Interactive);
        }
        other => panic!("expected Spawned, got {:?}", other),
    }

    // Double spawn is a structural error.
    let id = client.id();
    let err = client.request(dry_spawn(id, 1, dir.path())).await;
    match err {
        DaemonMessage::Error { code, .. } => assert_eq!(code, ErrorCode::AlreadySpawned),
        other => panic!("expected Error, got {:?}", other),
    }

    let id = client.id();
    let list = client.request(ClientMessage::List { id }).await;
    match list {
        DaemonMessage::List { panes, .. } => {
            assert_eq!(panes.len(), 1);
            assert_eq!(panes[0].pane_id, PaneId::new(1));
        }
        other => panic!("expected List, got {:?}", other),
    }

    let id = client.id();
    let killed = client
        .request(ClientMessage::Kill {
            id,
            pane_id: PaneId::new(1),
            expected: true,
        })
        .await;
    assert!(matches!(killed, DaemonMessage::Killed { .. }));

    // The exit event carries the expected flag from the kill.
    let exit = client
        .wait_for(|m| matches!(m, DaemonMessage::Exit { .. }))
        .await;
    match exit {
        DaemonMessage::Exit { expected, .. } => assert!(expected),
        _ => unreachable!(),
    }

    let id = client.id();
    client.request(ClientMessage::Shutdown { id }).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
}

#[tokio::test]
async fn test_attach_write_and_read_output() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let socket_path = config.socket_path.clone();

    let server_handle = tokio::spawn(async move { hive_daemon::run_server(config).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = TestClient::connect(&socket_path).await;

    let id = client.id();
    client.request(dry_spawn(id, 2, dir.path())).await;

    let id = client.id();
    let attached = client
        .request(ClientMessage::Attach {
            id,
            pane_id: PaneId::new(2),
        })
        .await;
    assert!(matches!(attached, DaemonMessage::Attached { .. }));

    let id = client.id();
    let payload = base64::engine::general_purpose::STANDARD.encode(b"hello agent");
    let ack = client
        .request(ClientMessage::Write {
            id,
            pane_id: PaneId::new(2),
            data: payload,
        })
        .await;
    assert!(matches!(ack, DaemonMessage::Ack { .. }));

    // The dry-run pane echoes input and then prints its canned response.
    let data = client
        .wait_for(|m| {
            if let DaemonMessage::Data { data, .. } = m {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .unwrap_or_default();
                String::from_utf8_lossy(&decoded).contains("hello agent")
            } else {
                false
            }
        })
        .await;
    assert!(matches!(data, DaemonMessage::Data { .. }));

    let id = client.id();
    client.request(ClientMessage::Shutdown { id }).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
}

#[tokio::test]
async fn test_unknown_pane_errors() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let socket_path = config.socket_path.clone();

    let server_handle = tokio::spawn(async move { hive_daemon::run_server(config).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = TestClient::connect(&socket_path).await;

    let id = client.id();
    let err = client
        .request(ClientMessage::Write {
            id,
            pane_id: PaneId::new(42),
            data: base64::engine::general_purpose::STANDARD.encode(b"x"),
        })
        .await;
    match err {
        DaemonMessage::Error { code, .. } => assert_eq!(code, ErrorCode::NotFound),
        other => panic!("expected Error, got {:?}", other),
    }

    let id = client.id();
    let err = client
        .request(ClientMessage::Kill {
            id,
            pane_id: PaneId::new(42),
            expected: false,
        })
        .await;
    assert!(matches!(err, DaemonMessage::Error { .. }));

    let id = client.id();
    client.request(ClientMessage::Shutdown { id }).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
}

#[tokio::test]
async fn test_session_state_persisted_across_daemon_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let socket_path = config.socket_path.clone();
    let state_path = config.session_state_path.clone();

    let server_handle = tokio::spawn(async move { hive_daemon::run_server(config).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    {
        let mut client = TestClient::connect(&socket_path).await;
        let id = client.id();
        client.request(dry_spawn(id, 1, dir.path())).await;

        let id = client.id();
        let ack = client.request(ClientMessage::SaveSession { id }).await;
        assert!(matches!(ack, DaemonMessage::Ack { .. }));
        assert!(state_path.exists());

        let id = client.id();
        client.request(ClientMessage::Shutdown { id }).await;
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    // Restart the daemon on the same workspace: the entry survives, marked
    // not alive, and seeds get_session.
    let config = test_config(dir.path());
    let socket_path = config.socket_path.clone();
    let server_handle = tokio::spawn(async move { hive_daemon::run_server(config).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = TestClient::connect(&socket_path).await;
    let id = client.id();
    let session = client
        .request(ClientMessage::GetSession { id, pane_id: None })
        .await;
    match session {
        DaemonMessage::Session { entries, .. } => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].pane_id, PaneId::new(1));
            assert!(!entries[0].alive);
        }
        other => panic!("expected Session, got {:?}", other),
    }

    let id = client.id();
    client.request(ClientMessage::Shutdown { id }).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
}

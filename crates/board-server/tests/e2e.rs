//! End-to-end tests for the board hub.
//!
//! Runs a real hub on a random port over an in-memory store and talks to it
//! with raw WebSocket clients and with a full `SyncSession`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use board_server::{
    BoardStore, ClientOptions, FileSystem, Frame, HandshakeMessage, Hub, InMemoryFs,
    ReconnectConfig, RemoteTransport, WebSocketServer,
};
use board_sync::{
    BoardMessage, BoardSnapshot, Element, InMemoryCanvas, SessionConfig, SyncSession,
    SystemClock, Transport,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

struct TestHub {
    addr: SocketAddr,
    fs: Arc<InMemoryFs>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestHub {
    async fn start(tokens: &[&str]) -> Self {
        let fs = Arc::new(InMemoryFs::new());
        seed_board(&fs, "demo").await;
        seed_board(&fs, "other").await;

        let server = WebSocketServer::new(
            "test-hub".to_string(),
            tokens.iter().map(|t| t.to_string()),
        );
        let listener = WebSocketServer::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let hub = Hub::new(server, BoardStore::new(fs.clone()));
        let task = tokio::spawn(hub.run(listener, None, std::future::pending::<()>()));

        Self { addr, fs, task }
    }
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Joining a board with a snapshot is answered with `board-update`, which
/// tells the test the join went through.
async fn seed_board(fs: &InMemoryFs, board: &str) {
    let snapshot = serde_json::to_vec(&BoardSnapshot::default()).unwrap();
    fs.write(&format!("{}/board.json", board), &snapshot)
        .await
        .unwrap();
}

/// Test client that speaks the wire protocol directly.
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Connect and exchange handshakes.
    async fn connect(addr: SocketAddr, token: Option<&str>) -> Self {
        let url = format!("ws://{}", addr);
        let (ws, _) = connect_async(&url).await.expect("Failed to connect");
        let mut client = Self { ws };

        match client.recv_frame().await {
            Frame::Handshake(handshake) => assert_eq!(handshake.role, "server"),
            other => panic!("Expected handshake, got {:?}", other),
        }

        let ours = HandshakeMessage::client(
            &format!("test-client-{}", uuid::Uuid::new_v4()),
            token.map(str::to_string),
        );
        client.send_text(ours.to_text().unwrap()).await;
        client
    }

    /// Connect and join `board`, waiting for the snapshot reply.
    async fn join(addr: SocketAddr, board: &str) -> Self {
        let mut client = Self::connect(addr, None).await;
        client
            .send(BoardMessage::JoinBoard {
                board_name: board.to_string(),
            })
            .await;
        match client.recv().await {
            BoardMessage::BoardUpdate { board_name, .. } => assert_eq!(board_name, board),
            other => panic!("Expected board-update, got {:?}", other),
        }
        client
    }

    async fn recv_frame(&mut self) -> Frame {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Frame::parse(text.as_str()).expect("Malformed frame")
                }
                Some(Ok(Message::Close(_))) => panic!("Connection closed unexpectedly"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("WebSocket error: {}", e),
                None => panic!("Stream ended unexpectedly"),
            }
        }
    }

    async fn recv(&mut self) -> BoardMessage {
        match timeout(WAIT, self.recv_frame()).await {
            Ok(Frame::Board(message)) => message,
            Ok(other) => panic!("Expected board message, got {:?}", other),
            Err(_) => panic!("Timeout waiting for message"),
        }
    }

    /// Receive messages until one matches.
    async fn recv_until(&mut self, matches: impl Fn(&BoardMessage) -> bool) -> BoardMessage {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.recv_frame()).await {
                Ok(Frame::Board(message)) if matches(&message) => return message,
                Ok(_) => continue,
                Err(_) => panic!("Timeout waiting for matching message"),
            }
        }
    }

    /// Assert nothing arrives for a short while.
    async fn expect_silence(&mut self) {
        if let Ok(frame) = timeout(QUIET, self.recv_frame()).await {
            panic!("Expected no message, got {:?}", frame);
        }
    }

    async fn send(&mut self, message: BoardMessage) {
        self.send_text(message.encode().unwrap()).await;
    }

    async fn send_text(&mut self, text: String) {
        self.ws
            .send(Message::text(text))
            .await
            .expect("Failed to send message");
    }
}

async fn wait_for_dir(fs: &InMemoryFs, path: &str) {
    let deadline = Instant::now() + WAIT;
    while !fs.is_dir(path).await.unwrap() {
        assert!(Instant::now() < deadline, "{} never appeared", path);
        sleep(Duration::from_millis(20)).await;
    }
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_invalid_token_is_rejected() {
    let hub = TestHub::start(&["secret"]).await;
    let mut client = TestClient::connect(hub.addr, Some("wrong")).await;

    match timeout(WAIT, client.recv_frame()).await {
        Ok(Frame::Rejected(rejected)) => assert_eq!(rejected.reason, "invalid token"),
        other => panic!("Expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_token_is_rejected() {
    let hub = TestHub::start(&["secret"]).await;
    let mut client = TestClient::connect(hub.addr, None).await;

    assert!(matches!(
        timeout(WAIT, client.recv_frame()).await,
        Ok(Frame::Rejected(_))
    ));
}

#[tokio::test]
async fn test_valid_token_can_join() {
    let hub = TestHub::start(&["secret"]).await;
    let mut client = TestClient::connect(hub.addr, Some("secret")).await;

    client
        .send(BoardMessage::JoinBoard {
            board_name: "demo".into(),
        })
        .await;
    assert!(matches!(client.recv().await, BoardMessage::BoardUpdate { .. }));
}

// ============================================================================
// Relay
// ============================================================================

#[tokio::test]
async fn test_folder_created_reaches_other_sessions_of_the_board() {
    let hub = TestHub::start(&[]).await;
    let mut alice = TestClient::join(hub.addr, "demo").await;
    let mut bob = TestClient::join(hub.addr, "demo").await;
    let mut carol = TestClient::join(hub.addr, "other").await;

    alice
        .send(BoardMessage::CreateDirectory {
            element_id: "f1".into(),
            name: "Research".into(),
        })
        .await;

    assert_eq!(
        bob.recv().await,
        BoardMessage::FolderCreated {
            element_id: "f1".into(),
            name: "Research".into()
        }
    );
    assert!(hub.fs.is_dir("demo/Research").await.unwrap());
    alice.expect_silence().await;
    carol.expect_silence().await;
}

#[tokio::test]
async fn test_state_is_acknowledged_and_relayed() {
    let hub = TestHub::start(&[]).await;
    let mut alice = TestClient::join(hub.addr, "demo").await;
    let mut bob = TestClient::join(hub.addr, "demo").await;
    let snapshot = BoardSnapshot::new(vec![Element::frame("f1", Some("Research")).to_canvas()]);

    alice
        .send(BoardMessage::UpdateState {
            board_name: "demo".into(),
            board: snapshot.clone(),
            request_id: "r1".into(),
        })
        .await;

    assert_eq!(
        alice.recv().await,
        BoardMessage::StateSaved {
            board_name: "demo".into(),
            request_id: "r1".into()
        }
    );
    assert_eq!(
        bob.recv().await,
        BoardMessage::BoardUpdate {
            board_name: "demo".into(),
            board: snapshot
        }
    );
}

#[tokio::test]
async fn test_file_update_is_relayed_once() {
    let hub = TestHub::start(&[]).await;
    let mut alice = TestClient::join(hub.addr, "demo").await;
    let mut bob = TestClient::join(hub.addr, "demo").await;
    let update = BoardMessage::UpdateFile {
        path: "demo/notes.md".into(),
        content: "# Notes".into(),
    };

    alice.send(update.clone()).await;
    assert!(matches!(bob.recv().await, BoardMessage::FileAdded { .. }));

    // Same content again is a no-op.
    alice.send(update).await;
    bob.expect_silence().await;
    assert_eq!(hub.fs.read("demo/notes.md").await.unwrap(), b"# Notes");
}

#[tokio::test]
async fn test_paths_outside_the_board_are_ignored() {
    let hub = TestHub::start(&[]).await;
    let mut alice = TestClient::join(hub.addr, "demo").await;
    let mut carol = TestClient::join(hub.addr, "other").await;

    alice
        .send(BoardMessage::UpdateFile {
            path: "other/../../etc/notes.md".into(),
            content: "x".into(),
        })
        .await;
    alice
        .send(BoardMessage::CreateFile {
            path: "other/notes.md".into(),
        })
        .await;

    carol.expect_silence().await;
    assert!(!hub.fs.exists("other/notes.md").await.unwrap());
}

// ============================================================================
// Frame renames
// ============================================================================

#[tokio::test]
async fn test_rename_moves_existing_folder() {
    let hub = TestHub::start(&[]).await;
    hub.fs.write("demo/Draft/a.md", b"a").await.unwrap();
    let mut alice = TestClient::join(hub.addr, "demo").await;
    let mut bob = TestClient::join(hub.addr, "demo").await;

    let rename = BoardMessage::FolderRenamed {
        element_id: "f1".into(),
        old_name: "Draft".into(),
        new_name: "Final".into(),
    };
    alice.send(rename.clone()).await;

    assert_eq!(bob.recv().await, rename);
    assert!(!hub.fs.exists("demo/Draft").await.unwrap());
    assert_eq!(hub.fs.read("demo/Final/a.md").await.unwrap(), b"a");
}

#[tokio::test]
async fn test_rename_of_missing_folder_creates_new_one() {
    let hub = TestHub::start(&[]).await;
    let mut alice = TestClient::join(hub.addr, "demo").await;
    let mut bob = TestClient::join(hub.addr, "demo").await;

    alice
        .send(BoardMessage::FolderRenamed {
            element_id: "f1".into(),
            old_name: "Draft".into(),
            new_name: "Final".into(),
        })
        .await;

    assert_eq!(
        bob.recv().await,
        BoardMessage::FolderCreated {
            element_id: "f1".into(),
            name: "Final".into()
        }
    );
    assert!(hub.fs.is_dir("demo/Final").await.unwrap());
}

// ============================================================================
// Full session over the network
// ============================================================================

#[tokio::test]
async fn test_sync_session_over_remote_transport() {
    let hub = TestHub::start(&[]).await;
    let mut observer = TestClient::join(hub.addr, "demo").await;

    let transport = RemoteTransport::connect(ClientOptions {
        url: format!("ws://{}", hub.addr),
        peer_id: "session".into(),
        token: None,
        reconnect: ReconnectConfig::default(),
    });
    let session = SyncSession::new(
        SessionConfig::new("demo"),
        transport.clone(),
        Arc::new(SystemClock),
    );
    session.initialize();
    let canvas = Arc::new(InMemoryCanvas::new());
    session.set_document_instance(canvas.clone());

    let driver = {
        let transport = transport.clone();
        let session = session.clone();
        tokio::spawn(async move {
            transport.drive(&session, Duration::from_millis(20)).await;
        })
    };

    let deadline = Instant::now() + WAIT;
    while !transport.is_connected() {
        assert!(Instant::now() < deadline, "Transport never connected");
        sleep(Duration::from_millis(20)).await;
    }

    canvas.edit(|elements| elements.push(Element::frame("f1", Some("Research")).to_canvas()));

    let created = observer
        .recv_until(|m| matches!(m, BoardMessage::FolderCreated { .. }))
        .await;
    assert_eq!(
        created,
        BoardMessage::FolderCreated {
            element_id: "f1".into(),
            name: "Research".into()
        }
    );
    wait_for_dir(&hub.fs, "demo/Research").await;

    driver.abort();
    session.shutdown();
    transport.close();
}

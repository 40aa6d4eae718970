//! End-to-end tests over a real WebSocket listener.
//!
//! These start the actual accept loop on an ephemeral port and drive it
//! with real `tokio-tungstenite` clients, verifying the full wire path:
//! JSON control events, the binary join handshake, update fan-out, and the
//! authentication timeout.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use quill_collab::{DocRegistry, Frame, ServerEvent, SyncEngine, SyncPayload, TokenVerifier};
use quill_server::{ServerCtx, StaticTokenVerifier};
use quill_store::{Actor, PermissionStore, Role, VaultStore};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    _dir: tempfile::TempDir,
    port: u16,
    engine: Arc<SyncEngine>,
    permissions: Arc<PermissionStore>,
}

async fn start_server(auth_timeout: Duration) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(VaultStore::new(dir.path()));
    store.init().await.unwrap();
    let registry = Arc::new(DocRegistry::with_debounce(
        store,
        Duration::from_millis(30),
    ));
    let permissions = Arc::new(PermissionStore::in_memory().unwrap());

    let mut verifier = StaticTokenVerifier::new();
    verifier.insert("tok-a", 1, "alice", false);
    verifier.insert("tok-b", 2, "bob", false);
    let verifier: Arc<dyn TokenVerifier> = Arc::new(verifier);

    let engine = Arc::new(SyncEngine::new(registry, permissions.clone(), verifier));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let ctx = Arc::new(ServerCtx {
        engine: engine.clone(),
        auth_timeout,
    });
    tokio::spawn(async move {
        let _ = quill_server::ws::run(listener, ctx).await;
    });

    TestServer {
        _dir: dir,
        port,
        engine,
        permissions,
    }
}

async fn connect(port: u16) -> Socket {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .expect("connect to test server");
    socket
}

async fn send_json(socket: &mut Socket, json: &str) {
    socket
        .send(Message::Text(json.to_string().into()))
        .await
        .unwrap();
}

/// Next JSON control event, skipping binary frames.
async fn next_event(socket: &mut Socket) -> ServerEvent {
    loop {
        let msg = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for event")
            .expect("connection closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("valid server event");
        }
    }
}

/// Next binary frame, skipping control events.
async fn next_frame(socket: &mut Socket) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("socket error");
        if let Message::Binary(data) = msg {
            let bytes: Vec<u8> = data.into();
            return Frame::decode(&bytes).expect("valid frame");
        }
    }
}

async fn authenticate(socket: &mut Socket, token: &str) -> ServerEvent {
    send_json(
        socket,
        &format!(r#"{{"event":"authenticate","token":"{token}"}}"#),
    );
    next_event(socket).await
}

/// Produce a yrs update that sets `path` to `content` in a fresh replica.
fn client_update(doc: &yrs::Doc, path: &str, content: &str) -> Vec<u8> {
    use yrs::{Map, Text, TextPrelim, Transact};
    let files = doc.get_or_insert_map("files");
    let mut txn = doc.transact_mut();
    let text = files.insert(&mut txn, path, TextPrelim::new(""));
    text.insert(&mut txn, 0, content);
    txn.encode_update_v1()
}

#[tokio::test]
async fn handshake_sequence_over_the_wire() {
    let server = start_server(Duration::from_secs(5)).await;
    let mut socket = connect(server.port).await;

    match authenticate(&mut socket, "tok-a").await {
        ServerEvent::Authenticated { success: true, user: Some(user) } => {
            assert_eq!(user.user_id, 1);
            assert_eq!(user.name, "alice");
        }
        other => panic!("expected successful auth, got {other:?}"),
    }

    send_json(&mut socket, r#"{"event":"join-vault","vaultId":"v1"}"#);
    match next_event(&mut socket).await {
        ServerEvent::VaultJoined { vault_id, role } => {
            assert_eq!(vault_id, "v1");
            assert_eq!(role, Role::Owner);
        }
        other => panic!("expected vault-joined, got {other:?}"),
    }
    match next_event(&mut socket).await {
        ServerEvent::FileList { files } => assert!(files.is_empty()),
        other => panic!("expected file-list, got {other:?}"),
    }

    // Binary catch-up: SyncStep1 (state vector) then the eager SyncStep2.
    match next_frame(&mut socket).await {
        Frame::Sync(SyncPayload::Step1(_)) => {}
        other => panic!("expected SyncStep1, got {other:?}"),
    }
    match next_frame(&mut socket).await {
        Frame::Sync(SyncPayload::Step2(_)) => {}
        other => panic!("expected SyncStep2, got {other:?}"),
    }
}

#[tokio::test]
async fn updates_fan_out_between_real_sockets() {
    let server = start_server(Duration::from_secs(5)).await;

    let mut alice = connect(server.port).await;
    authenticate(&mut alice, "tok-a").await;
    send_json(&mut alice, r#"{"event":"join-vault","vaultId":"v1"}"#);
    // Drain Alice's handshake (vault-joined, file-list, Step1, Step2).
    next_event(&mut alice).await;
    next_event(&mut alice).await;
    next_frame(&mut alice).await;
    next_frame(&mut alice).await;

    server
        .permissions
        .add_member("v1", 2, Role::Editor, Actor::User(1))
        .unwrap();
    let mut bob = connect(server.port).await;
    authenticate(&mut bob, "tok-b").await;
    send_json(&mut bob, r#"{"event":"join-vault","vaultId":"v1"}"#);
    next_event(&mut bob).await;
    next_event(&mut bob).await;
    next_frame(&mut bob).await;
    next_frame(&mut bob).await;

    // Alice edits; Bob receives the update as a binary frame.
    let doc = yrs::Doc::new();
    let update = client_update(&doc, "note.md", "over the wire");
    alice
        .send(Message::Binary(Frame::sync_update(update).encode().into()))
        .await
        .unwrap();

    match next_frame(&mut bob).await {
        Frame::Sync(SyncPayload::Update(bytes)) => {
            use yrs::updates::decoder::Decode;
            use yrs::{GetString, Map, Out, Transact};
            let replica = yrs::Doc::new();
            let files = replica.get_or_insert_map("files");
            {
                let mut txn = replica.transact_mut();
                txn.apply_update(yrs::Update::decode_v1(&bytes).unwrap())
                    .unwrap();
            }
            let txn = replica.transact();
            match files.get(&txn, "note.md") {
                Some(Out::YText(text)) => assert_eq!(text.get_string(&txn), "over the wire"),
                other => panic!("update missing note.md: {other:?}"),
            }
        }
        other => panic!("expected update frame, got {other:?}"),
    }

    let stats = server.engine.stats();
    assert!(stats.total_connections >= 2);
    assert!(stats.broadcasts >= 1);
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let server = start_server(Duration::from_secs(5)).await;
    let mut socket = connect(server.port).await;
    match authenticate(&mut socket, "nope").await {
        ServerEvent::Authenticated { success: false, user: None } => {}
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn unauthenticated_connections_time_out() {
    let server = start_server(Duration::from_millis(200)).await;
    let mut socket = connect(server.port).await;

    // Never authenticate: the server reports the timeout and hangs up.
    match next_event(&mut socket).await {
        ServerEvent::Error { message } => assert!(message.contains("timed out")),
        other => panic!("expected timeout error, got {other:?}"),
    }
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match socket.next().await {
                None | Some(Ok(Message::Close(_))) => break,
                Some(Err(_)) => break,
                _ => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server should close the connection");
}

#[tokio::test]
async fn ping_pong_roundtrip() {
    let server = start_server(Duration::from_secs(5)).await;
    let mut socket = connect(server.port).await;
    authenticate(&mut socket, "tok-a").await;
    send_json(&mut socket, r#"{"event":"ping"}"#);
    match next_event(&mut socket).await {
        ServerEvent::Pong => {}
        other => panic!("expected pong, got {other:?}"),
    }
}

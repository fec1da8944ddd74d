//! Integration tests for end-to-end board synchronization.
//!
//! These tests start a real server and connect real WebSocket clients,
//! driving the JSON protocol exactly as a browser client would.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tabula_collab::protocol::{ClientEvent, ErrorCode, ObjectMove, ServerEvent};
use tabula_collab::server::{ServerConfig, SyncServer};
use tabula_core::{BoardObject, ObjectKind, ObjectPatch};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port with one pre-created board.
///
/// Returns the port, a handle for direct store access, and the tempdir
/// guard keeping the storage path alive.
async fn start_test_server(board_id: &str) -> (u16, Arc<SyncServer>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_objects_per_board: 50,
        broadcast_capacity: 64,
        storage_path: dir.path().join("db"),
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    server.store().create_board(board_id).unwrap();

    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, server, dir)
}

async fn connect(port: u16) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut WsClient, event: &ClientEvent) {
    let frame = serde_json::to_string(event).unwrap();
    ws.send(Message::Text(frame.into())).await.unwrap();
}

/// Next server event on this socket, failing the test after 2s.
async fn recv(ws: &mut WsClient) -> ServerEvent {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for server event")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(frame) = msg {
            return ServerEvent::decode(frame.as_str()).unwrap();
        }
    }
}

/// Assert that nothing arrives on this socket for a while.
async fn assert_silent(ws: &mut WsClient) {
    let result = timeout(Duration::from_millis(200), ws.next()).await;
    assert!(result.is_err(), "expected silence, got {result:?}");
}

/// Join a board and swallow the board:state reply.
async fn join(ws: &mut WsClient, board_id: &str, user_name: &str) -> Uuid {
    let user_id = Uuid::new_v4();
    send(
        ws,
        &ClientEvent::Join {
            board_id: board_id.to_string(),
            user_id,
            user_name: user_name.to_string(),
        },
    )
    .await;
    match recv(ws).await {
        ServerEvent::BoardState { .. } => {}
        other => panic!("expected board:state, got {other:?}"),
    }
    user_id
}

fn sticky(id: &str) -> BoardObject {
    BoardObject {
        id: id.to_string(),
        kind: ObjectKind::Sticky {
            text: "hello".into(),
            color: "#ffd700".into(),
            width: 200.0,
            height: 150.0,
        },
        x: 10.0,
        y: 20.0,
        rotation: 0.0,
        frame_id: None,
        created_by: String::new(),
        last_edited_by: String::new(),
        created_at: 0,
        updated_at: 0,
    }
}

#[tokio::test]
async fn test_join_receives_board_state() {
    let (port, _server, _dir) = start_test_server("b1").await;
    let mut ws = connect(port).await;

    send(
        &mut ws,
        &ClientEvent::Join {
            board_id: "b1".into(),
            user_id: Uuid::new_v4(),
            user_name: "alice".into(),
        },
    )
    .await;

    match recv(&mut ws).await {
        ServerEvent::BoardState { board_id, objects } => {
            assert_eq!(board_id, "b1");
            assert!(objects.is_empty());
        }
        other => panic!("expected board:state, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_unknown_board_is_not_found() {
    let (port, _server, _dir) = start_test_server("b1").await;
    let mut ws = connect(port).await;

    send(
        &mut ws,
        &ClientEvent::Join {
            board_id: "ghost".into(),
            user_id: Uuid::new_v4(),
            user_name: "alice".into(),
        },
    )
    .await;

    match recv(&mut ws).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::NotFound),
        other => panic!("expected board:error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_create_reaches_peer_but_not_sender() {
    let (port, _server, _dir) = start_test_server("b1").await;

    let mut alice = connect(port).await;
    let alice_id = join(&mut alice, "b1", "alice").await;

    let mut bob = connect(port).await;
    join(&mut bob, "b1", "bob").await;

    // Alice sees Bob join
    match recv(&mut alice).await {
        ServerEvent::PresenceJoin { user_name, .. } => assert_eq!(user_name, "bob"),
        other => panic!("expected presence:join, got {other:?}"),
    }

    send(
        &mut alice,
        &ClientEvent::CreateObject {
            board_id: "b1".into(),
            object: sticky("o1"),
            timestamp: 1,
        },
    )
    .await;

    // Bob receives the server-stamped object
    match recv(&mut bob).await {
        ServerEvent::ObjectCreated { object, .. } => {
            assert_eq!(object.id, "o1");
            assert_eq!(object.created_by, alice_id.to_string());
            assert!(object.created_at > 0);
        }
        other => panic!("expected object:created, got {other:?}"),
    }

    // Alice gets no echo of her own create
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_create_on_cold_cache_lazy_loads() {
    let (port, server, _dir) = start_test_server("b1").await;

    let mut alice = connect(port).await;
    join(&mut alice, "b1", "alice").await;
    let mut bob = connect(port).await;
    join(&mut bob, "b1", "bob").await;
    let _ = recv(&mut alice).await; // presence:join for bob

    // Force a cache miss mid-session
    assert!(server.store().evict("b1").await);

    send(
        &mut alice,
        &ClientEvent::CreateObject {
            board_id: "b1".into(),
            object: sticky("o1"),
            timestamp: 1,
        },
    )
    .await;

    // The mutation recovered by reloading from the durable store
    match recv(&mut bob).await {
        ServerEvent::ObjectCreated { object, .. } => assert_eq!(object.id, "o1"),
        other => panic!("expected object:created, got {other:?}"),
    }
    assert!(server.store().get_state("b1").await.unwrap().contains("o1"));
}

#[tokio::test]
async fn test_event_for_wrong_board_rejected() {
    let (port, server, _dir) = start_test_server("b1").await;
    server.store().create_board("b2").unwrap();

    let mut ws = connect(port).await;
    join(&mut ws, "b1", "alice").await;

    send(
        &mut ws,
        &ClientEvent::CreateObject {
            board_id: "b2".into(),
            object: sticky("o1"),
            timestamp: 1,
        },
    )
    .await;

    match recv(&mut ws).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::NotInBoard),
        other => panic!("expected board:error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_event_before_join_rejected() {
    let (port, _server, _dir) = start_test_server("b1").await;

    // No join: the session registry has no binding for this connection,
    // so the mutation is refused.
    let mut ws = connect(port).await;
    send(
        &mut ws,
        &ClientEvent::CreateObject {
            board_id: "b1".into(),
            object: sticky("o1"),
            timestamp: 1,
        },
    )
    .await;

    match recv(&mut ws).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::NotInBoard),
        other => panic!("expected board:error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_frame_gets_invalid_payload() {
    let (port, _server, _dir) = start_test_server("b1").await;
    let mut ws = connect(port).await;

    ws.send(Message::Text("{\"type\":\"object:create\"}".into()))
        .await
        .unwrap();

    match recv(&mut ws).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidPayload),
        other => panic!("expected board:error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_create_is_conflict() {
    let (port, _server, _dir) = start_test_server("b1").await;
    let mut ws = connect(port).await;
    join(&mut ws, "b1", "alice").await;

    let create = ClientEvent::CreateObject {
        board_id: "b1".into(),
        object: sticky("o1"),
        timestamp: 1,
    };
    send(&mut ws, &create).await;
    send(&mut ws, &create).await;

    match recv(&mut ws).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::Conflict),
        other => panic!("expected board:error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delete_of_missing_object_is_silent() {
    let (port, _server, _dir) = start_test_server("b1").await;

    let mut alice = connect(port).await;
    join(&mut alice, "b1", "alice").await;
    let mut bob = connect(port).await;
    join(&mut bob, "b1", "bob").await;
    let _ = recv(&mut alice).await; // presence:join

    send(
        &mut alice,
        &ClientEvent::DeleteObject {
            board_id: "b1".into(),
            object_id: "already-gone".into(),
            timestamp: 1,
        },
    )
    .await;

    // No error to the sender, no broadcast to the peer
    assert_silent(&mut alice).await;
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn test_update_broadcasts_patch() {
    let (port, _server, _dir) = start_test_server("b1").await;

    let mut alice = connect(port).await;
    let alice_id = join(&mut alice, "b1", "alice").await;
    let mut bob = connect(port).await;
    join(&mut bob, "b1", "bob").await;
    let _ = recv(&mut alice).await; // presence:join

    send(
        &mut alice,
        &ClientEvent::CreateObject {
            board_id: "b1".into(),
            object: sticky("o1"),
            timestamp: 1,
        },
    )
    .await;
    let _ = recv(&mut bob).await; // object:created

    send(
        &mut alice,
        &ClientEvent::UpdateObject {
            board_id: "b1".into(),
            object_id: "o1".into(),
            updates: ObjectPatch::move_to(99.0, 88.0),
            timestamp: 2,
        },
    )
    .await;

    match recv(&mut bob).await {
        ServerEvent::ObjectUpdated {
            object_id, updates, ..
        } => {
            assert_eq!(object_id, "o1");
            assert_eq!(updates.x, Some(99.0));
            assert_eq!(updates.y, Some(88.0));
            // Server stamped the actor
            assert_eq!(updates.last_edited_by, Some(alice_id.to_string()));
        }
        other => panic!("expected object:updated, got {other:?}"),
    }
}

#[tokio::test]
async fn test_edit_warning_on_concurrent_edit() {
    let (port, _server, _dir) = start_test_server("b1").await;

    let mut alice = connect(port).await;
    let alice_id = join(&mut alice, "b1", "alice").await;
    let mut bob = connect(port).await;
    join(&mut bob, "b1", "bob").await;
    let _ = recv(&mut alice).await; // presence:join

    send(
        &mut alice,
        &ClientEvent::EditStart {
            board_id: "b1".into(),
            object_id: "o1".into(),
            timestamp: 1,
        },
    )
    .await;
    let _ = recv(&mut bob).await; // edit:start from alice

    send(
        &mut bob,
        &ClientEvent::EditStart {
            board_id: "b1".into(),
            object_id: "o1".into(),
            timestamp: 2,
        },
    )
    .await;

    // Bob is warned about Alice; Alice in turn sees Bob's edit:start
    match recv(&mut bob).await {
        ServerEvent::EditWarning { editors, .. } => {
            assert_eq!(editors.len(), 1);
            assert_eq!(editors[0].user_id, alice_id);
            assert_eq!(editors[0].user_name, "alice");
        }
        other => panic!("expected edit:warning, got {other:?}"),
    }
    match recv(&mut alice).await {
        ServerEvent::EditStarted { user_name, .. } => assert_eq!(user_name, "bob"),
        other => panic!("expected edit:start, got {other:?}"),
    }
}

#[tokio::test]
async fn test_batch_create_echoes_to_sender() {
    let (port, _server, _dir) = start_test_server("b1").await;

    let mut alice = connect(port).await;
    join(&mut alice, "b1", "alice").await;

    send(
        &mut alice,
        &ClientEvent::BatchCreate {
            board_id: "b1".into(),
            objects: vec![sticky("o1"), sticky("o2")],
            timestamp: 1,
        },
    )
    .await;

    // Unlike single creates, the sender receives the stamped batch too
    match recv(&mut alice).await {
        ServerEvent::BatchCreated { objects, .. } => {
            assert_eq!(objects.len(), 2);
            assert!(objects.iter().all(|o| o.created_at > 0));
        }
        other => panic!("expected objects:batch_created, got {other:?}"),
    }
}

#[tokio::test]
async fn test_batch_move_broadcast() {
    let (port, _server, _dir) = start_test_server("b1").await;

    let mut alice = connect(port).await;
    join(&mut alice, "b1", "alice").await;
    let mut bob = connect(port).await;
    join(&mut bob, "b1", "bob").await;
    let _ = recv(&mut alice).await; // presence:join

    send(
        &mut alice,
        &ClientEvent::BatchCreate {
            board_id: "b1".into(),
            objects: vec![sticky("o1"), sticky("o2")],
            timestamp: 1,
        },
    )
    .await;
    let _ = recv(&mut alice).await; // objects:batch_created (echo)
    let _ = recv(&mut bob).await;

    send(
        &mut alice,
        &ClientEvent::BatchUpdate {
            board_id: "b1".into(),
            moves: vec![
                ObjectMove { object_id: "o1".into(), x: 1.0, y: 2.0 },
                ObjectMove { object_id: "o2".into(), x: 3.0, y: 4.0 },
            ],
            timestamp: 2,
        },
    )
    .await;

    match recv(&mut bob).await {
        ServerEvent::BatchUpdated { moves, .. } => {
            assert_eq!(moves.len(), 2);
            assert_eq!(moves[0].object_id, "o1");
        }
        other => panic!("expected objects:batch_update, got {other:?}"),
    }
}

#[tokio::test]
async fn test_mismatched_heartbeat_is_dropped_silently() {
    let (port, _server, _dir) = start_test_server("b1").await;
    let mut ws = connect(port).await;
    join(&mut ws, "b1", "alice").await;

    // Wrong board and bogus timestamp: both dropped without a reply
    send(
        &mut ws,
        &ClientEvent::Heartbeat {
            board_id: "other".into(),
            timestamp: 1,
        },
    )
    .await;
    send(
        &mut ws,
        &ClientEvent::Heartbeat {
            board_id: "b1".into(),
            timestamp: 0,
        },
    )
    .await;

    assert_silent(&mut ws).await;
}

#[tokio::test]
async fn test_disconnect_flushes_board_to_durable() {
    let (port, server, _dir) = start_test_server("b1").await;

    let mut ws = connect(port).await;
    join(&mut ws, "b1", "alice").await;

    send(
        &mut ws,
        &ClientEvent::CreateObject {
            board_id: "b1".into(),
            object: sticky("o1"),
            timestamp: 1,
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Last member leaves: the room closes and the board is written back
    ws.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(server.store().board_version("b1").unwrap(), 1);
}

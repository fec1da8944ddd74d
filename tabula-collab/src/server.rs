//! WebSocket sync server with room-based board routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── BoardRoom (board_id) ── BoardStore ── MutationEngine
//! Client B ──┘         │                      │
//!                      │                      └── BoardRecordStore (RocksDB)
//!                      │
//!           ┌──────────┼───────────┐
//!           ▼          ▼           ▼
//!        Client A   Client B    Client C
//! ```
//!
//! Every inbound event runs the same pipeline: decode, membership check,
//! server stamp, mutate through the store, then fan out. Ordering within
//! a connection is the socket's frame order; ordering across connections
//! is whatever order the per-board mutation lock grants.
//!
//! Timestamps on the wire are advisory. The server stamps `created_at`,
//! `updated_at` and the actor fields itself, so client clock skew never
//! reaches the stored document.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BoardRoom, MemberInfo, RoomRegistry};
use crate::locks::{EditLockManager, DEFAULT_LOCK_TTL};
use crate::presence::{PresenceTracker, DEFAULT_PRESENCE_TTL};
use crate::protocol::{ClientEvent, EditorInfo, ErrorCode, ServerEvent};
use crate::session::{ConnectionRegistry, ConnectionSession};
use crate::store::{epoch_ms, BoardStore, StoreError};
use crate::storage::{BoardRecordStore, StorageConfig, StorageError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Per-board object cap
    pub max_objects_per_board: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Advisory edit-lock lifetime
    pub lock_ttl: Duration,
    /// Presence window after the last heartbeat
    pub presence_ttl: Duration,
    /// Durable store path
    pub storage_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_objects_per_board: 1000,
            broadcast_capacity: 256,
            lock_ttl: DEFAULT_LOCK_TTL,
            presence_ttl: DEFAULT_PRESENCE_TTL,
            storage_path: PathBuf::from("tabula-data"),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_events: u64,
    pub active_rooms: usize,
}

/// Collaborators shared by every connection task.
struct Shared {
    config: ServerConfig,
    store: BoardStore,
    rooms: RoomRegistry,
    locks: EditLockManager,
    presence: PresenceTracker,
    sessions: ConnectionRegistry,
    stats: RwLock<ServerStats>,
}

/// Per-connection mutable state inside the event loop. The session
/// registry, not this struct, is authoritative for board membership;
/// only the room handle lives here.
struct ConnState {
    connection_id: Uuid,
    room: Option<Arc<BoardRoom>>,
}

/// The board sync server.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Open the durable store and build the server's collaborators.
    pub fn new(config: ServerConfig) -> Result<Self, StorageError> {
        let durable = Arc::new(BoardRecordStore::open(StorageConfig {
            path: config.storage_path.clone(),
            ..StorageConfig::default()
        })?);

        let shared = Shared {
            store: BoardStore::new(durable, config.max_objects_per_board),
            rooms: RoomRegistry::new(config.broadcast_capacity),
            locks: EditLockManager::new(config.lock_ttl),
            presence: PresenceTracker::new(config.presence_ttl),
            sessions: ConnectionRegistry::new(),
            stats: RwLock::new(ServerStats::default()),
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn store(&self) -> &BoardStore {
        &self.shared.store
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.shared.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(shared, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

type ConnError = Box<dyn std::error::Error + Send + Sync>;

/// Handle a single WebSocket connection.
async fn handle_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), ConnError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut state = ConnState {
        connection_id: Uuid::new_v4(),
        room: None,
    };
    let mut broadcast_rx: Option<broadcast::Receiver<crate::broadcast::RoomMessage>> = None;

    loop {
        tokio::select! {
            // Incoming WebSocket frame
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(frame))) => {
                        {
                            let mut s = shared.stats.write().await;
                            s.total_events += 1;
                        }

                        match ClientEvent::decode(frame.as_str()) {
                            Ok(event) => {
                                let (replies, new_rx) =
                                    handle_event(&shared, &mut state, event).await;
                                if let Some(rx) = new_rx {
                                    broadcast_rx = Some(rx);
                                }
                                for reply in replies {
                                    ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                                }
                            }
                            Err(e) => {
                                log::warn!("Undecodable frame from {addr}: {e}");
                                let error = ServerEvent::error(
                                    ErrorCode::InvalidPayload,
                                    "Malformed event payload",
                                );
                                ws_sender.send(Message::Text(error.encode()?.into())).await?;
                            }
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            // Outgoing room broadcast
            msg = async {
                match broadcast_rx {
                    Some(ref mut rx) => rx.recv().await,
                    // No room joined yet — wait forever
                    None => std::future::pending().await,
                }
            } => {
                match msg {
                    Ok(room_msg) => {
                        // Exclusion rule: skip own messages unless flagged
                        if room_msg.origin == state.connection_id && !room_msg.include_origin {
                            continue;
                        }
                        ws_sender
                            .send(Message::Text(room_msg.payload.to_string().into()))
                            .await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Connection {} lagged by {n} messages", state.connection_id);
                    }
                    Err(_) => break,
                }
            }
        }
    }

    disconnect_cleanup(&shared, &mut state).await;

    Ok(())
}

/// Dispatch one decoded event. Returns replies for the sender plus a new
/// broadcast receiver when the event joined a room.
async fn handle_event(
    shared: &Shared,
    state: &mut ConnState,
    event: ClientEvent,
) -> (
    Vec<ServerEvent>,
    Option<broadcast::Receiver<crate::broadcast::RoomMessage>>,
) {
    let event = match event {
        ClientEvent::Join {
            board_id,
            user_id,
            user_name,
        } => {
            return handle_join(shared, state, board_id, user_id, user_name).await;
        }
        other => other,
    };

    // Membership gate for everything after the join, resolved through
    // the session registry. Heartbeats fail silently; everything else
    // gets a NOT_IN_BOARD error.
    let Some(session) = shared.sessions.get(&state.connection_id).await else {
        if matches!(event, ClientEvent::Heartbeat { .. }) {
            return (Vec::new(), None);
        }
        return (
            vec![ServerEvent::error(
                ErrorCode::NotInBoard,
                "Join a board before sending events",
            )],
            None,
        );
    };
    if session.board_id != event.board_id() {
        if matches!(event, ClientEvent::Heartbeat { .. }) {
            return (Vec::new(), None);
        }
        return (
            vec![ServerEvent::error(
                ErrorCode::NotInBoard,
                format!("Not joined to board {}", event.board_id()),
            )],
            None,
        );
    }

    let replies = match event {
        ClientEvent::Join { .. } => unreachable!("handled above"),

        ClientEvent::CreateObject {
            board_id, object, ..
        } => {
            let mut object = object;
            stamp_new_object(&mut object, &session);

            match shared.store.add_object(&board_id, object.clone()).await {
                Ok(()) => {
                    broadcast_to_peers(
                        state,
                        &ServerEvent::ObjectCreated { board_id, object },
                    )
                    .await;
                    Vec::new()
                }
                Err(e) => vec![store_error_reply(e)],
            }
        }

        ClientEvent::UpdateObject {
            board_id,
            object_id,
            updates,
            ..
        } => {
            let mut updates = updates;
            updates.last_edited_by = Some(session.user_id.to_string());
            updates.updated_at = Some(epoch_ms());

            match shared
                .store
                .update_object(&board_id, &object_id, &updates)
                .await
            {
                Ok(()) => {
                    // Sustained text editing keeps the advisory lock warm
                    // without explicit edit:start round trips.
                    if updates.touches_text() {
                        shared
                            .locks
                            .refresh(&board_id, &object_id, session.user_id)
                            .await;
                    }
                    broadcast_to_peers(
                        state,
                        &ServerEvent::ObjectUpdated {
                            board_id,
                            object_id,
                            updates,
                        },
                    )
                    .await;
                    Vec::new()
                }
                // Racing against a delete is normal; the object is gone
                // either way, so the late update just disappears.
                Err(StoreError::NotFound(what)) => {
                    log::debug!("Dropping update for missing {what}");
                    Vec::new()
                }
                Err(e) => vec![store_error_reply(e)],
            }
        }

        ClientEvent::DeleteObject {
            board_id,
            object_id,
            ..
        } => match shared.store.remove_object(&board_id, &object_id).await {
            Ok(()) => {
                broadcast_to_peers(
                    state,
                    &ServerEvent::ObjectDeleted {
                        board_id,
                        object_id,
                    },
                )
                .await;
                Vec::new()
            }
            // Idempotent: deleting an already-deleted object succeeds
            // quietly and nothing is broadcast.
            Err(StoreError::NotFound(what)) => {
                log::debug!("Dropping delete for missing {what}");
                Vec::new()
            }
            Err(e) => vec![store_error_reply(e)],
        },

        ClientEvent::BatchUpdate {
            board_id, moves, ..
        } => {
            let edited_by = session.user_id.to_string();
            match shared
                .store
                .move_objects(&board_id, &moves, &edited_by)
                .await
            {
                Ok(moved) => {
                    log::debug!("Moved {moved}/{} objects on board {board_id}", moves.len());
                    broadcast_to_peers(
                        state,
                        &ServerEvent::BatchUpdated { board_id, moves },
                    )
                    .await;
                    Vec::new()
                }
                Err(e) => vec![store_error_reply(e)],
            }
        }

        ClientEvent::BatchCreate {
            board_id, objects, ..
        } => {
            let mut objects = objects;
            for object in &mut objects {
                stamp_new_object(object, &session);
            }

            match shared.store.batch_add(&board_id, objects.clone()).await {
                Ok(added) => {
                    log::debug!("Batch created {added}/{} objects on board {board_id}", objects.len());
                    // The one echo that includes the sender: bulk results
                    // carry server stamps the originating client needs.
                    broadcast_to_all(
                        state,
                        &ServerEvent::BatchCreated { board_id, objects },
                    )
                    .await;
                    Vec::new()
                }
                Err(e) => vec![store_error_reply(e)],
            }
        }

        ClientEvent::BatchDelete {
            board_id,
            object_ids,
            ..
        } => match shared.store.batch_remove(&board_id, &object_ids).await {
            Ok(removed) => {
                log::debug!(
                    "Batch deleted {removed}/{} objects on board {board_id}",
                    object_ids.len()
                );
                broadcast_to_peers(
                    state,
                    &ServerEvent::BatchDeleted {
                        board_id,
                        object_ids,
                    },
                )
                .await;
                Vec::new()
            }
            Err(StoreError::NotFound(what)) => {
                log::debug!("Dropping batch delete for missing {what}");
                Vec::new()
            }
            Err(e) => vec![store_error_reply(e)],
        },

        ClientEvent::EditStart {
            board_id,
            object_id,
            ..
        } => {
            let others = shared
                .locks
                .acquire(&board_id, &object_id, session.user_id, &session.user_name)
                .await;

            broadcast_to_peers(
                state,
                &ServerEvent::EditStarted {
                    board_id: board_id.clone(),
                    object_id: object_id.clone(),
                    user_id: session.user_id,
                    user_name: session.user_name.clone(),
                },
            )
            .await;

            if others.is_empty() {
                Vec::new()
            } else {
                vec![ServerEvent::EditWarning {
                    board_id,
                    object_id,
                    editors: others
                        .into_iter()
                        .map(|h| EditorInfo {
                            user_id: h.user_id,
                            user_name: h.user_name,
                        })
                        .collect(),
                }]
            }
        }

        ClientEvent::EditEnd {
            board_id,
            object_id,
            ..
        } => {
            if shared
                .locks
                .release(&board_id, &object_id, session.user_id)
                .await
            {
                broadcast_to_peers(
                    state,
                    &ServerEvent::EditEnded {
                        board_id,
                        object_id,
                        user_id: session.user_id,
                    },
                )
                .await;
            }
            Vec::new()
        }

        ClientEvent::Heartbeat {
            board_id,
            timestamp,
        } => {
            // Lossy by contract: a bad beat is dropped, never answered.
            if timestamp > 0 {
                shared
                    .presence
                    .touch(&board_id, session.user_id, &session.user_name)
                    .await;
            }
            Vec::new()
        }
    };

    (replies, None)
}

/// Bind the connection to a board: load state, enter the room, announce.
async fn handle_join(
    shared: &Shared,
    state: &mut ConnState,
    board_id: String,
    user_id: Uuid,
    user_name: String,
) -> (
    Vec<ServerEvent>,
    Option<broadcast::Receiver<crate::broadcast::RoomMessage>>,
) {
    let board_state = match shared.store.get_or_load(&board_id).await {
        Ok(s) => s,
        Err(e) => return (vec![store_error_reply(e)], None),
    };

    // A re-join on the same socket switches boards: leave the old room
    // first so the old board sees the departure.
    if state.room.is_some() {
        leave_current_room(shared, state).await;
    }

    shared
        .sessions
        .register(ConnectionSession {
            connection_id: state.connection_id,
            user_id,
            user_name: user_name.clone(),
            board_id: board_id.clone(),
        })
        .await;

    // Joining through the registry keeps this atomic with the
    // empty-room sweep in `leave_current_room`.
    let (room, rx) = shared
        .rooms
        .join(
            &board_id,
            MemberInfo {
                connection_id: state.connection_id,
                user_id,
                user_name: user_name.clone(),
            },
        )
        .await;

    shared.presence.touch(&board_id, user_id, &user_name).await;

    state.room = Some(room);

    {
        let mut s = shared.stats.write().await;
        s.active_rooms = shared.rooms.room_count().await;
    }

    broadcast_to_peers(
        state,
        &ServerEvent::PresenceJoin {
            board_id: board_id.clone(),
            user_id,
            user_name: user_name.clone(),
        },
    )
    .await;

    log::info!("{user_name} ({user_id}) joined board {board_id}");

    (
        vec![ServerEvent::BoardState {
            board_id,
            objects: board_state.objects,
        }],
        Some(rx),
    )
}

/// Leave the current room and announce the departure to remaining peers.
async fn leave_current_room(shared: &Shared, state: &mut ConnState) {
    let Some(session) = shared.sessions.unregister(&state.connection_id).await else {
        return;
    };

    if let Some(room) = state.room.take() {
        room.leave(&state.connection_id).await;

        room.send_to_peers(
            state.connection_id,
            encode_or_log(&ServerEvent::PresenceLeave {
                board_id: session.board_id.clone(),
                user_id: session.user_id,
            }),
        );

        // Room empties: write the board back and drop the room. The
        // cached document stays resident for the next joiner.
        if room.member_count().await == 0 {
            match shared.store.flush_to_durable(&session.board_id).await {
                Ok(version) => {
                    log::info!(
                        "Board {} flushed at version {version} (room closing)",
                        session.board_id
                    );
                }
                Err(e) => {
                    log::error!("Flush failed for board {}: {e}", session.board_id);
                }
            }
            shared.rooms.remove_if_empty(&session.board_id).await;
        }
    }

    shared
        .presence
        .leave(&session.board_id, session.user_id)
        .await;

    // Locks are NOT released: the TTL covers the reconnect grace period.
    let held = shared
        .locks
        .list_user_locks(&session.board_id, session.user_id)
        .await;
    if !held.is_empty() {
        log::debug!(
            "{} left board {} still holding locks on {held:?} (expire by TTL)",
            session.user_name,
            session.board_id
        );
    }
}

async fn disconnect_cleanup(shared: &Shared, state: &mut ConnState) {
    leave_current_room(shared, state).await;

    let mut s = shared.stats.write().await;
    s.active_connections = s.active_connections.saturating_sub(1);
    s.active_rooms = shared.rooms.room_count().await;
}

/// Server-side stamps on a freshly created object. Client clocks and
/// claimed authorship are overwritten wholesale.
fn stamp_new_object(object: &mut tabula_core::BoardObject, session: &ConnectionSession) {
    let now = epoch_ms();
    let actor = session.user_id.to_string();
    object.created_by = actor.clone();
    object.last_edited_by = actor;
    object.created_at = now;
    object.updated_at = now;
}

fn store_error_reply(e: StoreError) -> ServerEvent {
    let message = e.to_string();
    let code = match e {
        StoreError::Conflict(_) => ErrorCode::Conflict,
        StoreError::NotFound(_) => ErrorCode::NotFound,
        StoreError::CapacityExceeded(_) => ErrorCode::CapacityExceeded,
        StoreError::Upstream(_) => ErrorCode::UpstreamFailure,
    };
    ServerEvent::error(code, message)
}

async fn broadcast_to_peers(state: &ConnState, event: &ServerEvent) {
    if let Some(room) = &state.room {
        room.send_to_peers(state.connection_id, encode_or_log(event));
    }
}

async fn broadcast_to_all(state: &ConnState, event: &ServerEvent) {
    if let Some(room) = &state.room {
        room.send_to_all(state.connection_id, encode_or_log(event));
    }
}

fn encode_or_log(event: &ServerEvent) -> Arc<str> {
    match event.encode() {
        Ok(frame) => Arc::from(frame),
        Err(e) => {
            // Serialization of our own enums cannot realistically fail;
            // degrade to an empty object rather than killing the room.
            log::error!("Failed to encode server event: {e}");
            Arc::from("{}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_objects_per_board, 1000);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.lock_ttl, Duration::from_secs(20));
        assert_eq!(config.presence_ttl, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_server_creation() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            storage_path: dir.path().join("db"),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            storage_path: dir.path().join("db"),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();

        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_events, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[test]
    fn test_store_error_mapping() {
        let reply = store_error_reply(StoreError::Conflict("o1".into()));
        assert!(matches!(
            reply,
            ServerEvent::Error {
                code: ErrorCode::Conflict,
                ..
            }
        ));

        let reply = store_error_reply(StoreError::CapacityExceeded(1000));
        assert!(matches!(
            reply,
            ServerEvent::Error {
                code: ErrorCode::CapacityExceeded,
                ..
            }
        ));

        let reply = store_error_reply(StoreError::Upstream("db down".into()));
        assert!(matches!(
            reply,
            ServerEvent::Error {
                code: ErrorCode::UpstreamFailure,
                ..
            }
        ));
    }

    #[test]
    fn test_stamp_overwrites_client_claims() {
        let session = ConnectionSession {
            connection_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            user_name: "alice".into(),
            board_id: "b1".into(),
        };

        let mut object = tabula_core::BoardObject {
            id: "o1".into(),
            kind: tabula_core::ObjectKind::Sticky {
                text: "hi".into(),
                color: "#fff".into(),
                width: 100.0,
                height: 100.0,
            },
            x: 0.0,
            y: 0.0,
            rotation: 0.0,
            frame_id: None,
            created_by: "forged".into(),
            last_edited_by: "forged".into(),
            created_at: 1,
            updated_at: 1,
        };

        stamp_new_object(&mut object, &session);
        assert_eq!(object.created_by, session.user_id.to_string());
        assert_eq!(object.last_edited_by, session.user_id.to_string());
        assert!(object.created_at > 1);
        assert_eq!(object.created_at, object.updated_at);
    }
}

//! Fan-out broadcast to N-1 peers with backpressure.
//!
//! Each board room shares one tokio broadcast channel; every member
//! holds an independent receiver that buffers up to `capacity` messages.
//! Messages carry the origin connection id so receivers can implement
//! the exclusion rule locally: peer echoes exclude the sender unless the
//! message is explicitly flagged to include it (bulk create results are
//! the one case where the sender needs the server-stamped payload back).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// A member of a board room, keyed by connection id.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberInfo {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
}

/// One payload fanned out through a room channel.
///
/// The payload is pre-encoded JSON behind an `Arc` so a room-wide send
/// never re-serializes per receiver.
#[derive(Debug, Clone)]
pub struct RoomMessage {
    /// Connection that caused this message.
    pub origin: Uuid,
    /// Whether the origin's own receiver should deliver it.
    pub include_origin: bool,
    pub payload: Arc<str>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub messages_sent: u64,
    pub active_members: usize,
}

/// A broadcast room for a single board.
pub struct BoardRoom {
    sender: broadcast::Sender<RoomMessage>,
    members: RwLock<HashMap<Uuid, MemberInfo>>,
    capacity: usize,
    // Lock-free counter, never touched with the members lock held
    messages_sent: AtomicU64,
}

impl BoardRoom {
    /// `capacity` bounds how many messages buffer per receiver before a
    /// lagging member starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Add a member and hand back their receiver.
    pub async fn join(&self, info: MemberInfo) -> broadcast::Receiver<RoomMessage> {
        let mut members = self.members.write().await;
        members.insert(info.connection_id, info);
        self.sender.subscribe()
    }

    pub async fn leave(&self, connection_id: &Uuid) -> Option<MemberInfo> {
        self.members.write().await.remove(connection_id)
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<MemberInfo> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn has_member(&self, connection_id: &Uuid) -> bool {
        self.members.read().await.contains_key(connection_id)
    }

    /// Fan a payload out to every member except the origin.
    pub fn send_to_peers(&self, origin: Uuid, payload: Arc<str>) -> usize {
        self.send(RoomMessage {
            origin,
            include_origin: false,
            payload,
        })
    }

    /// Fan a payload out to every member, the origin included.
    pub fn send_to_all(&self, origin: Uuid, payload: Arc<str>) -> usize {
        self.send(RoomMessage {
            origin,
            include_origin: true,
            payload,
        })
    }

    fn send(&self, msg: RoomMessage) -> usize {
        // send fails only when there are no receivers; an empty room is
        // not an error for a broadcast.
        let count = self.sender.send(msg).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }
}

/// Room registry: maps board ids to broadcast rooms.
///
/// Rooms are created on first join and removed when the last member
/// leaves, so the map only holds boards with live connections.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<BoardRoom>>>,
    default_capacity: usize,
}

impl RoomRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Add a member to a board's room, creating the room if needed, and
    /// hand back the room with the member's receiver.
    ///
    /// Lookup and join happen under one registry lock so the empty-room
    /// sweep ([`Self::remove_if_empty`]) can never run between them: the
    /// room joined is always the registered one.
    pub async fn join(
        &self,
        board_id: &str,
        info: MemberInfo,
    ) -> (Arc<BoardRoom>, broadcast::Receiver<RoomMessage>) {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(board_id) {
            Some(room) => room.clone(),
            None => {
                let room = Arc::new(BoardRoom::new(self.default_capacity));
                rooms.insert(board_id.to_string(), room.clone());
                room
            }
        };
        let rx = room.join(info).await;
        (room, rx)
    }

    pub async fn get(&self, board_id: &str) -> Option<Arc<BoardRoom>> {
        self.rooms.read().await.get(board_id).cloned()
    }

    pub async fn remove_if_empty(&self, board_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(board_id) {
            if room.member_count().await == 0 {
                rooms.remove(board_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_boards(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

//! Presence tracking fed by client heartbeats.
//!
//! Heartbeats are lossy by design: a missed beat must never produce an
//! error or drop a connection. The tracker only records the most recent
//! valid beat per (board, user) and expires entries lazily when read.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

/// How long a user stays "present" after their last heartbeat.
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct PresenceEntry {
    user_name: String,
    last_seen: Instant,
}

/// A user currently considered present on a board.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentUser {
    pub user_id: Uuid,
    pub user_name: String,
}

pub struct PresenceTracker {
    ttl: Duration,
    entries: RwLock<HashMap<(String, Uuid), PresenceEntry>>,
}

impl PresenceTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Record a heartbeat. Overwrites any previous beat for the pair.
    pub async fn touch(&self, board_id: &str, user_id: Uuid, user_name: &str) {
        self.entries.write().await.insert(
            (board_id.to_string(), user_id),
            PresenceEntry {
                user_name: user_name.to_string(),
                last_seen: Instant::now(),
            },
        );
    }

    /// Remove a user from a board's presence set (explicit leave).
    pub async fn leave(&self, board_id: &str, user_id: Uuid) -> bool {
        self.entries
            .write()
            .await
            .remove(&(board_id.to_string(), user_id))
            .is_some()
    }

    /// Users on a board with a heartbeat inside the TTL window. Expired
    /// entries are purged as a side effect.
    pub async fn active_users(&self, board_id: &str) -> Vec<PresentUser> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|(b, _), entry| b != board_id || now - entry.last_seen < self.ttl);

        entries
            .iter()
            .filter(|((b, _), _)| b == board_id)
            .map(|((_, user_id), entry)| PresentUser {
                user_id: *user_id,
                user_name: entry.user_name.clone(),
            })
            .collect()
    }

    pub async fn is_active(&self, board_id: &str, user_id: Uuid) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .get(&(board_id.to_string(), user_id))
            .is_some_and(|entry| now - entry.last_seen < self.ttl)
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TTL)
    }
}

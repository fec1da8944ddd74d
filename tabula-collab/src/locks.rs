//! Advisory edit locks for concurrent-editing awareness.
//!
//! Locks never block writes. Acquiring a lock on an object another user
//! already holds succeeds and reports the other holders, so the client
//! can warn rather than refuse. Every holder is tracked independently —
//! the same object can carry any number of live locks at once.
//!
//! Entries expire by TTL and are purged lazily on the next touch of the
//! same key set. Disconnects do NOT release locks: the holder may be
//! reconnecting, and expiry covers the case where they are gone for good.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

/// Default lock lifetime. Editing clients re-acquire on sustained edits.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LockKey {
    board_id: String,
    object_id: String,
    user_id: Uuid,
}

#[derive(Debug, Clone)]
struct LockEntry {
    display_name: String,
    expires_at: Instant,
}

/// A live lock holder, as reported to warning payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct LockHolder {
    pub user_id: Uuid,
    pub user_name: String,
}

/// Registry of per-object advisory locks across all boards.
pub struct EditLockManager {
    ttl: Duration,
    locks: RwLock<HashMap<LockKey, LockEntry>>,
}

impl EditLockManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Record a lock for `user_id` on an object and report the OTHER
    /// live holders. Acquire always succeeds; an empty return means the
    /// caller is editing alone.
    pub async fn acquire(
        &self,
        board_id: &str,
        object_id: &str,
        user_id: Uuid,
        display_name: &str,
    ) -> Vec<LockHolder> {
        let now = Instant::now();
        let mut locks = self.locks.write().await;

        // Lazy purge of anything expired on this object.
        locks.retain(|key, entry| {
            key.board_id != board_id || key.object_id != object_id || entry.expires_at > now
        });

        let others: Vec<LockHolder> = locks
            .iter()
            .filter(|(key, _)| {
                key.board_id == board_id && key.object_id == object_id && key.user_id != user_id
            })
            .map(|(key, entry)| LockHolder {
                user_id: key.user_id,
                user_name: entry.display_name.clone(),
            })
            .collect();

        locks.insert(
            LockKey {
                board_id: board_id.to_string(),
                object_id: object_id.to_string(),
                user_id,
            },
            LockEntry {
                display_name: display_name.to_string(),
                expires_at: now + self.ttl,
            },
        );

        others
    }

    /// Drop this user's lock on the object, if held.
    pub async fn release(&self, board_id: &str, object_id: &str, user_id: Uuid) -> bool {
        self.locks
            .write()
            .await
            .remove(&LockKey {
                board_id: board_id.to_string(),
                object_id: object_id.to_string(),
                user_id,
            })
            .is_some()
    }

    /// Extend a held lock's lifetime. Returns false when the lock is not
    /// held (or already expired) — a refresh never implicitly acquires.
    pub async fn refresh(&self, board_id: &str, object_id: &str, user_id: Uuid) -> bool {
        let now = Instant::now();
        let mut locks = self.locks.write().await;
        let key = LockKey {
            board_id: board_id.to_string(),
            object_id: object_id.to_string(),
            user_id,
        };
        match locks.get_mut(&key) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + self.ttl;
                true
            }
            Some(_) => {
                locks.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Live locks a user holds on one board. Used on disconnect to log
    /// what is left behind for the TTL grace period.
    pub async fn list_user_locks(&self, board_id: &str, user_id: Uuid) -> Vec<String> {
        let now = Instant::now();
        self.locks
            .read()
            .await
            .iter()
            .filter(|(key, entry)| {
                key.board_id == board_id && key.user_id == user_id && entry.expires_at > now
            })
            .map(|(key, _)| key.object_id.clone())
            .collect()
    }

    /// Live holders on one object, excluding nobody.
    pub async fn holders(&self, board_id: &str, object_id: &str) -> Vec<LockHolder> {
        let now = Instant::now();
        self.locks
            .read()
            .await
            .iter()
            .filter(|(key, entry)| {
                key.board_id == board_id && key.object_id == object_id && entry.expires_at > now
            })
            .map(|(key, entry)| LockHolder {
                user_id: key.user_id,
                user_name: entry.display_name.clone(),
            })
            .collect()
    }
}

impl Default for EditLockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TTL)
    }
}

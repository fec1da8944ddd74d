//! Atomic mutation engine for cached board state.
//!
//! Architecture:
//! ```text
//! connection A ──┐                    ┌── board "b1" ── Mutex<CachedBoardState>
//!                ├── MutationEngine ──┤
//! connection B ──┘                    └── board "b2" ── Mutex<CachedBoardState>
//! ```
//!
//! Every operation is one indivisible read-modify-write: the per-board
//! mutex is held for the whole critical section, which closes the
//! read→mutate→write race window between two clients dragging the same
//! object milliseconds apart. Operations against the same board serialize;
//! operations against different boards never contend — each board is its
//! own consistency domain, so stateless server replicas can share the
//! cache without a distributed lock manager.
//!
//! The engine never loads from the durable store itself. A miss returns
//! [`MutationCode::NoState`] and the caller (the board store) lazy-loads
//! and retries exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use tabula_core::{BoardObject, CachedBoardState, ObjectPatch};

/// Outcome of a single mutation, mirroring the cache-script contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum MutationCode {
    /// Mutation applied.
    Applied = 0,
    /// Duplicate id on add, or object not found on update/remove.
    Rejected = -1,
    /// No cached document at this key — lazy-load then retry exactly once.
    NoState = -2,
    /// Per-board object cap reached.
    CapacityExceeded = -3,
}

impl MutationCode {
    pub fn as_i8(self) -> i8 {
        self as i8
    }
}

/// In-process cache of board documents with per-board atomic mutation.
pub struct MutationEngine {
    boards: RwLock<HashMap<String, Arc<Mutex<CachedBoardState>>>>,
}

impl Default for MutationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationEngine {
    pub fn new() -> Self {
        Self {
            boards: RwLock::new(HashMap::new()),
        }
    }

    /// Look up the cache entry for a board, if loaded.
    async fn entry(&self, board_id: &str) -> Option<Arc<Mutex<CachedBoardState>>> {
        self.boards.read().await.get(board_id).cloned()
    }

    /// Snapshot of the cached state, if loaded.
    pub async fn get_state(&self, board_id: &str) -> Option<CachedBoardState> {
        let entry = self.entry(board_id).await?;
        let state = entry.lock().await;
        Some(state.clone())
    }

    /// Install or fully replace a board's cached document.
    ///
    /// This is the full-document replace path: last replace wins, with no
    /// per-field merging. Used by lazy load and by derived multi-step
    /// operations that cannot be expressed as a single atomic mutation.
    pub async fn put_state(&self, state: CachedBoardState) {
        let board_id = state.board_id.clone();

        // Fast path: replace in place under the per-board lock.
        if let Some(entry) = self.entry(&board_id).await {
            let mut current = entry.lock().await;
            *current = state;
            return;
        }

        // Slow path: first load. Double-check under the write lock.
        let mut boards = self.boards.write().await;
        match boards.get(&board_id) {
            Some(entry) => {
                let mut current = entry.lock().await;
                *current = state;
            }
            None => {
                boards.insert(board_id, Arc::new(Mutex::new(state)));
            }
        }
    }

    /// Record a durable sync point on the cached document in place.
    ///
    /// Only the metadata moves; the object list is untouched, so
    /// mutations confirmed while a flush was writing are never rolled
    /// back. Returns false when the board is not cached.
    pub async fn mark_synced(&self, board_id: &str, version: u64, synced_at: u64) -> bool {
        let Some(entry) = self.entry(board_id).await else {
            return false;
        };
        let mut state = entry.lock().await;
        state.store_version = version;
        state.last_synced_at = synced_at;
        true
    }

    /// Drop a board from the cache. Only the external board-lifecycle
    /// collaborator (board deletion) triggers this — the engine never
    /// evicts on its own.
    pub async fn evict(&self, board_id: &str) -> bool {
        self.boards.write().await.remove(board_id).is_some()
    }

    pub async fn cached_board_count(&self) -> usize {
        self.boards.read().await.len()
    }

    /// Add one object. Rejects duplicate ids and enforces the board cap.
    pub async fn add(
        &self,
        board_id: &str,
        object: BoardObject,
        max_objects: usize,
    ) -> MutationCode {
        let Some(entry) = self.entry(board_id).await else {
            return MutationCode::NoState;
        };
        let mut state = entry.lock().await;
        if state.contains(&object.id) {
            return MutationCode::Rejected;
        }
        if state.len() >= max_objects {
            return MutationCode::CapacityExceeded;
        }
        state.objects.push(object);
        MutationCode::Applied
    }

    /// Merge a patch into one object by id.
    pub async fn update(
        &self,
        board_id: &str,
        object_id: &str,
        patch: &ObjectPatch,
    ) -> MutationCode {
        let Some(entry) = self.entry(board_id).await else {
            return MutationCode::NoState;
        };
        let mut state = entry.lock().await;
        match state.find_mut(object_id) {
            Some(object) => {
                object.apply_patch(patch);
                MutationCode::Applied
            }
            None => MutationCode::Rejected,
        }
    }

    /// Remove one object by id.
    pub async fn remove(&self, board_id: &str, object_id: &str) -> MutationCode {
        let Some(entry) = self.entry(board_id).await else {
            return MutationCode::NoState;
        };
        let mut state = entry.lock().await;
        let before = state.len();
        state.objects.retain(|o| o.id != object_id);
        if state.len() < before {
            MutationCode::Applied
        } else {
            MutationCode::Rejected
        }
    }

    /// Add many objects in one critical section.
    ///
    /// Ids already present are skipped, making resubmission idempotent per
    /// item. If the genuinely new objects would push the board past the
    /// cap, nothing is inserted and the whole batch fails.
    pub async fn batch_add(
        &self,
        board_id: &str,
        objects: Vec<BoardObject>,
        max_objects: usize,
    ) -> Result<usize, MutationCode> {
        let Some(entry) = self.entry(board_id).await else {
            return Err(MutationCode::NoState);
        };
        let mut state = entry.lock().await;

        let fresh: Vec<BoardObject> = objects
            .into_iter()
            .filter(|o| !state.contains(&o.id))
            .collect();

        if state.len() + fresh.len() > max_objects {
            return Err(MutationCode::CapacityExceeded);
        }

        let added = fresh.len();
        state.objects.extend(fresh);
        Ok(added)
    }

    /// Merge many patches in one critical section, matched by id.
    /// Unmatched ids are silently skipped (tolerant of stale client state).
    pub async fn batch_update(
        &self,
        board_id: &str,
        patches: &[(String, ObjectPatch)],
    ) -> Result<usize, MutationCode> {
        let Some(entry) = self.entry(board_id).await else {
            return Err(MutationCode::NoState);
        };
        let mut state = entry.lock().await;

        let mut updated = 0;
        for (object_id, patch) in patches {
            if let Some(object) = state.find_mut(object_id) {
                object.apply_patch(patch);
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Remove many objects in one critical section.
    /// Unmatched ids are ignored; returns the count actually removed.
    pub async fn batch_remove(
        &self,
        board_id: &str,
        object_ids: &[String],
    ) -> Result<usize, MutationCode> {
        let Some(entry) = self.entry(board_id).await else {
            return Err(MutationCode::NoState);
        };
        let mut state = entry.lock().await;

        let before = state.len();
        state
            .objects
            .retain(|o| !object_ids.iter().any(|id| id == &o.id));
        Ok(before - state.len())
    }
}

//! Board state store: cache lookup, lazy durable load, and write-back.
//!
//! Sits between the connection handlers and the two stores:
//! ```text
//! handlers ──► BoardStore ──► MutationEngine (cache, atomic per board)
//!                  │
//!                  └────────► BoardRecordStore (durable, versioned)
//! ```
//!
//! The cache and the durable store share no transaction. The compensation
//! is the lazy-load-then-retry pattern: a mutation that finds no cached
//! document loads the board from the durable store, installs it, and
//! retries the same mutation exactly once. The retry bound is strict —
//! there is no other retry loop in the engine, and durable-store failures
//! are never auto-retried (no retry storms during an outage).
//!
//! Flush-back snapshots the cache, so the durable record may miss
//! mutations that land mid-flush; the next flush picks them up. The
//! cache itself is never rolled back by a flush.

use std::sync::Arc;
use std::time::SystemTime;

use tabula_core::{BoardObject, CachedBoardState, ObjectPatch};

use crate::engine::{MutationCode, MutationEngine};
use crate::protocol::ObjectMove;
use crate::storage::{BoardRecordStore, StorageError};

/// Epoch milliseconds, used for `last_synced_at` and server stamps.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Typed errors the orchestration layer surfaces to callers.
///
/// `NoState` never escapes this layer — it is recovered internally by the
/// single load-and-retry; a retry that still misses escalates to
/// `Upstream`.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Duplicate object id on create.
    Conflict(String),
    /// Board or object missing.
    NotFound(String),
    /// Per-board object cap reached.
    CapacityExceeded(usize),
    /// Durable store or cache unavailable.
    Upstream(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict(id) => write!(f, "Object id already exists: {id}"),
            StoreError::NotFound(what) => write!(f, "Not found: {what}"),
            StoreError::CapacityExceeded(cap) => {
                write!(f, "Board object limit reached ({cap})")
            }
            StoreError::Upstream(e) => write!(f, "Upstream failure: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(id) => StoreError::NotFound(format!("board {id}")),
            other => StoreError::Upstream(other.to_string()),
        }
    }
}

/// Cache-plus-durable orchestration for board documents.
pub struct BoardStore {
    engine: Arc<MutationEngine>,
    durable: Arc<BoardRecordStore>,
    max_objects: usize,
}

impl BoardStore {
    pub fn new(durable: Arc<BoardRecordStore>, max_objects: usize) -> Self {
        Self {
            engine: Arc::new(MutationEngine::new()),
            durable,
            max_objects,
        }
    }

    pub fn engine(&self) -> &Arc<MutationEngine> {
        &self.engine
    }

    pub fn max_objects(&self) -> usize {
        self.max_objects
    }

    // ─── Cache / durable sync ─────────────────────────────────────────

    /// Cached state, if loaded.
    pub async fn get_state(&self, board_id: &str) -> Option<CachedBoardState> {
        self.engine.get_state(board_id).await
    }

    /// Load a board from the durable store into the cache.
    ///
    /// Builds a fresh cached document from the authoritative object list
    /// and version. Fails with `NotFound` for absent or soft-deleted
    /// boards.
    pub async fn load_to_cache(&self, board_id: &str) -> Result<CachedBoardState, StoreError> {
        let record = self.durable.get_board_record(board_id)?;

        let mut state = CachedBoardState::new(board_id, record.version, epoch_ms());
        state.objects = record.objects;

        self.engine.put_state(state.clone()).await;
        log::debug!(
            "Loaded board {board_id} into cache (version {}, {} objects)",
            state.store_version,
            state.objects.len()
        );
        Ok(state)
    }

    /// Cached state, loading it first if absent.
    pub async fn get_or_load(&self, board_id: &str) -> Result<CachedBoardState, StoreError> {
        match self.engine.get_state(board_id).await {
            Some(state) => Ok(state),
            None => self.load_to_cache(board_id).await,
        }
    }

    /// Full-document replace of the cached state.
    ///
    /// Last replace wins with no per-field merging — narrower atomicity
    /// than the engine's scripted mutations, used only by derived
    /// operations that need multi-step logic (see [`Self::move_objects`]).
    pub async fn save_state(&self, state: CachedBoardState) {
        self.engine.put_state(state).await;
    }

    /// Best-effort write-back of the cached object list to the durable
    /// store, advancing its version counter. Returns the new version.
    pub async fn flush_to_durable(&self, board_id: &str) -> Result<u64, StoreError> {
        let Some(state) = self.engine.get_state(board_id).await else {
            return Err(StoreError::NotFound(format!("no cached state for board {board_id}")));
        };

        let version = self.durable.write_back(board_id, &state.objects)?;

        // Record the sync point in place. Only the metadata moves, so
        // mutations confirmed while write_back ran stay in the cache and
        // the next flush picks them up.
        self.engine.mark_synced(board_id, version, epoch_ms()).await;

        log::debug!("Flushed board {board_id} to durable store at version {version}");
        Ok(version)
    }

    /// Drop a board from the cache (external board-deletion lifecycle).
    pub async fn evict(&self, board_id: &str) -> bool {
        self.engine.evict(board_id).await
    }

    // ─── Orchestrated single-object mutations ─────────────────────────

    /// Add one object, lazily loading the board on a cache miss.
    pub async fn add_object(
        &self,
        board_id: &str,
        object: BoardObject,
    ) -> Result<(), StoreError> {
        let mut code = self
            .engine
            .add(board_id, object.clone(), self.max_objects)
            .await;
        if code == MutationCode::NoState {
            self.load_to_cache(board_id).await?;
            code = self
                .engine
                .add(board_id, object.clone(), self.max_objects)
                .await;
        }

        match code {
            MutationCode::Applied => Ok(()),
            MutationCode::Rejected => Err(StoreError::Conflict(object.id)),
            MutationCode::CapacityExceeded => Err(StoreError::CapacityExceeded(self.max_objects)),
            MutationCode::NoState => Err(StoreError::Upstream(format!(
                "board {board_id} missing from cache after reload"
            ))),
        }
    }

    /// Merge a patch into one object, lazily loading on a cache miss.
    pub async fn update_object(
        &self,
        board_id: &str,
        object_id: &str,
        patch: &ObjectPatch,
    ) -> Result<(), StoreError> {
        let mut code = self.engine.update(board_id, object_id, patch).await;
        if code == MutationCode::NoState {
            self.load_to_cache(board_id).await?;
            code = self.engine.update(board_id, object_id, patch).await;
        }

        match code {
            MutationCode::Applied => Ok(()),
            MutationCode::Rejected => Err(StoreError::NotFound(format!("object {object_id}"))),
            MutationCode::CapacityExceeded => Err(StoreError::CapacityExceeded(self.max_objects)),
            MutationCode::NoState => Err(StoreError::Upstream(format!(
                "board {board_id} missing from cache after reload"
            ))),
        }
    }

    /// Remove one object, lazily loading on a cache miss.
    pub async fn remove_object(&self, board_id: &str, object_id: &str) -> Result<(), StoreError> {
        let mut code = self.engine.remove(board_id, object_id).await;
        if code == MutationCode::NoState {
            self.load_to_cache(board_id).await?;
            code = self.engine.remove(board_id, object_id).await;
        }

        match code {
            MutationCode::Applied => Ok(()),
            MutationCode::Rejected => Err(StoreError::NotFound(format!("object {object_id}"))),
            MutationCode::CapacityExceeded => Err(StoreError::CapacityExceeded(self.max_objects)),
            MutationCode::NoState => Err(StoreError::Upstream(format!(
                "board {board_id} missing from cache after reload"
            ))),
        }
    }

    // ─── Orchestrated batch mutations ─────────────────────────────────

    /// Batch add with the same lazy-load recovery. Returns the count of
    /// genuinely new objects inserted.
    pub async fn batch_add(
        &self,
        board_id: &str,
        objects: Vec<BoardObject>,
    ) -> Result<usize, StoreError> {
        match self
            .engine
            .batch_add(board_id, objects.clone(), self.max_objects)
            .await
        {
            Ok(added) => Ok(added),
            Err(MutationCode::NoState) => {
                self.load_to_cache(board_id).await?;
                match self.engine.batch_add(board_id, objects, self.max_objects).await {
                    Ok(added) => Ok(added),
                    Err(MutationCode::CapacityExceeded) => {
                        Err(StoreError::CapacityExceeded(self.max_objects))
                    }
                    Err(other) => Err(StoreError::Upstream(format!(
                        "batch add failed after reload (code {})",
                        other.as_i8()
                    ))),
                }
            }
            Err(MutationCode::CapacityExceeded) => {
                Err(StoreError::CapacityExceeded(self.max_objects))
            }
            Err(other) => Err(StoreError::Upstream(format!(
                "batch add failed (code {})",
                other.as_i8()
            ))),
        }
    }

    /// Batch remove with lazy-load recovery. Unmatched ids are ignored.
    pub async fn batch_remove(
        &self,
        board_id: &str,
        object_ids: &[String],
    ) -> Result<usize, StoreError> {
        match self.engine.batch_remove(board_id, object_ids).await {
            Ok(removed) => Ok(removed),
            Err(MutationCode::NoState) => {
                self.load_to_cache(board_id).await?;
                self.engine
                    .batch_remove(board_id, object_ids)
                    .await
                    .map_err(|code| {
                        StoreError::Upstream(format!(
                            "batch remove failed after reload (code {})",
                            code.as_i8()
                        ))
                    })
            }
            Err(other) => Err(StoreError::Upstream(format!(
                "batch remove failed (code {})",
                other.as_i8()
            ))),
        }
    }

    /// Apply absolute-position moves as a derived operation.
    ///
    /// This is the documented full-replace path: read the whole document,
    /// mutate the copy, replace. Per-field atomicity is traded for the
    /// multi-step logic; a concurrent single-object mutation between the
    /// read and the replace loses to this save. Object ids no longer
    /// present are skipped (stale client state is tolerated).
    pub async fn move_objects(
        &self,
        board_id: &str,
        moves: &[ObjectMove],
        edited_by: &str,
    ) -> Result<usize, StoreError> {
        let mut state = self.get_or_load(board_id).await?;

        let now = epoch_ms();
        let mut moved = 0;
        for mv in moves {
            if let Some(object) = state.find_mut(&mv.object_id) {
                object.x = mv.x;
                object.y = mv.y;
                object.last_edited_by = edited_by.to_string();
                object.updated_at = now;
                moved += 1;
            }
        }

        self.save_state(state).await;
        Ok(moved)
    }

    /// Board-lifecycle passthroughs for the external collaborator surface.
    pub fn create_board(&self, board_id: &str) -> Result<(), StorageError> {
        self.durable.create_board(board_id)
    }

    pub fn board_version(&self, board_id: &str) -> Result<u64, StorageError> {
        Ok(self.durable.load_meta(board_id)?.version)
    }
}

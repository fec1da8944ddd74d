//! # tabula-collab — Real-time board synchronization for Tabula
//!
//! WebSocket-based multiplayer whiteboard editing with last-write-wins
//! conflict resolution and durable board persistence.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │   Client    │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     JSON events     │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                              ┌─────────────┼─────────────┐
//!                              ▼             ▼             ▼
//!                       ┌────────────┐ ┌───────────┐ ┌───────────┐
//!                       │ BoardStore │ │ BoardRoom │ │ EditLocks │
//!                       │  (cache +  │ │ (fan-out) │ │ Presence  │
//!                       │  durable)  │ └───────────┘ └───────────┘
//!                       └─────┬──────┘
//!                             │
//!                       ┌─────┴──────┐
//!                       │  RocksDB   │
//!                       └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (serde-tagged events)
//! - [`engine`] — In-process board cache with atomic per-board mutation
//! - [`store`] — Cache/durable orchestration with lazy load and retry
//! - [`storage`] — Durable board records on RocksDB (bincode + LZ4)
//! - [`broadcast`] — Room-based fan-out with backpressure
//! - [`locks`] — Advisory multi-holder edit locks
//! - [`presence`] — Heartbeat-fed presence tracking
//! - [`session`] — Connection-to-board bindings
//! - [`server`] — WebSocket sync server

pub mod broadcast;
pub mod engine;
pub mod locks;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod store;

// Re-exports for convenience
pub use broadcast::{BoardRoom, MemberInfo, RoomMessage, RoomRegistry, RoomStats};
pub use engine::{MutationCode, MutationEngine};
pub use locks::{EditLockManager, LockHolder, DEFAULT_LOCK_TTL};
pub use presence::{PresenceTracker, PresentUser, DEFAULT_PRESENCE_TTL};
pub use protocol::{ClientEvent, EditorInfo, ErrorCode, ObjectMove, ProtocolError, ServerEvent};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{ConnectionRegistry, ConnectionSession};
pub use storage::{BoardMeta, BoardRecord, BoardRecordStore, StorageConfig, StorageError};
pub use store::{epoch_ms, BoardStore, StoreError};

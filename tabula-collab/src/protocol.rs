//! JSON wire protocol for board synchronization.
//!
//! Events travel as WebSocket text frames. Every inbound event carries a
//! `"type"` tag named after the operation (`object:create`, `heartbeat`, …)
//! plus the board id and a client timestamp; serde does the shape
//! validation, so a frame that fails to decode is answered with a single
//! `board:error { code: "INVALID_PAYLOAD" }` to the sender and nothing else.
//!
//! Outbound confirmations mirror the inbound names in past tense
//! (`object:created`). `board:error` only ever goes to the acting
//! connection — errors are never broadcast.

use serde::{Deserialize, Serialize};
use tabula_core::{BoardObject, ObjectPatch};
use uuid::Uuid;

/// Stable machine-readable error codes carried by `board:error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed payload — rejected before any mutation.
    InvalidPayload,
    /// Event's board does not match the connection's joined board.
    NotInBoard,
    /// Duplicate object id on create.
    Conflict,
    /// Per-board object cap reached.
    CapacityExceeded,
    /// Board or object missing.
    NotFound,
    /// Durable store or cache unavailable.
    UpstreamFailure,
}

/// An absolute position move inside `objects:batch_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMove {
    pub object_id: String,
    pub x: f64,
    pub y: f64,
}

/// A concurrent editor reported by `edit:warning`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorInfo {
    pub user_id: Uuid,
    pub user_name: String,
}

/// Client → server events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// First frame on a connection: binds the session to a board.
    #[serde(rename = "board:join", rename_all = "camelCase")]
    Join {
        board_id: String,
        user_id: Uuid,
        user_name: String,
    },

    #[serde(rename = "object:create", rename_all = "camelCase")]
    CreateObject {
        board_id: String,
        object: BoardObject,
        timestamp: i64,
    },

    #[serde(rename = "object:update", rename_all = "camelCase")]
    UpdateObject {
        board_id: String,
        object_id: String,
        updates: ObjectPatch,
        timestamp: i64,
    },

    #[serde(rename = "object:delete", rename_all = "camelCase")]
    DeleteObject {
        board_id: String,
        object_id: String,
        timestamp: i64,
    },

    #[serde(rename = "objects:batch_update", rename_all = "camelCase")]
    BatchUpdate {
        board_id: String,
        moves: Vec<ObjectMove>,
        timestamp: i64,
    },

    #[serde(rename = "objects:batch_create", rename_all = "camelCase")]
    BatchCreate {
        board_id: String,
        objects: Vec<BoardObject>,
        timestamp: i64,
    },

    #[serde(rename = "objects:batch_delete", rename_all = "camelCase")]
    BatchDelete {
        board_id: String,
        object_ids: Vec<String>,
        timestamp: i64,
    },

    #[serde(rename = "edit:start", rename_all = "camelCase")]
    EditStart {
        board_id: String,
        object_id: String,
        timestamp: i64,
    },

    #[serde(rename = "edit:end", rename_all = "camelCase")]
    EditEnd {
        board_id: String,
        object_id: String,
        timestamp: i64,
    },

    #[serde(rename = "heartbeat", rename_all = "camelCase")]
    Heartbeat { board_id: String, timestamp: i64 },
}

impl ClientEvent {
    /// Board id the event targets, for the membership check.
    pub fn board_id(&self) -> &str {
        match self {
            ClientEvent::Join { board_id, .. }
            | ClientEvent::CreateObject { board_id, .. }
            | ClientEvent::UpdateObject { board_id, .. }
            | ClientEvent::DeleteObject { board_id, .. }
            | ClientEvent::BatchUpdate { board_id, .. }
            | ClientEvent::BatchCreate { board_id, .. }
            | ClientEvent::BatchDelete { board_id, .. }
            | ClientEvent::EditStart { board_id, .. }
            | ClientEvent::EditEnd { board_id, .. }
            | ClientEvent::Heartbeat { board_id, .. } => board_id,
        }
    }

    /// Decode a text frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Full board snapshot sent to a joiner.
    #[serde(rename = "board:state", rename_all = "camelCase")]
    BoardState {
        board_id: String,
        objects: Vec<BoardObject>,
    },

    #[serde(rename = "object:created", rename_all = "camelCase")]
    ObjectCreated {
        board_id: String,
        object: BoardObject,
    },

    #[serde(rename = "object:updated", rename_all = "camelCase")]
    ObjectUpdated {
        board_id: String,
        object_id: String,
        updates: ObjectPatch,
    },

    #[serde(rename = "object:deleted", rename_all = "camelCase")]
    ObjectDeleted {
        board_id: String,
        object_id: String,
    },

    #[serde(rename = "objects:batch_update", rename_all = "camelCase")]
    BatchUpdated {
        board_id: String,
        moves: Vec<ObjectMove>,
    },

    #[serde(rename = "objects:batch_created", rename_all = "camelCase")]
    BatchCreated {
        board_id: String,
        objects: Vec<BoardObject>,
    },

    #[serde(rename = "objects:batch_deleted", rename_all = "camelCase")]
    BatchDeleted {
        board_id: String,
        object_ids: Vec<String>,
    },

    #[serde(rename = "edit:start", rename_all = "camelCase")]
    EditStarted {
        board_id: String,
        object_id: String,
        user_id: Uuid,
        user_name: String,
    },

    /// Sent to the requester only, listing concurrent editors.
    #[serde(rename = "edit:warning", rename_all = "camelCase")]
    EditWarning {
        board_id: String,
        object_id: String,
        editors: Vec<EditorInfo>,
    },

    #[serde(rename = "edit:end", rename_all = "camelCase")]
    EditEnded {
        board_id: String,
        object_id: String,
        user_id: Uuid,
    },

    #[serde(rename = "presence:join", rename_all = "camelCase")]
    PresenceJoin {
        board_id: String,
        user_id: Uuid,
        user_name: String,
    },

    #[serde(rename = "presence:leave", rename_all = "camelCase")]
    PresenceLeave { board_id: String, user_id: Uuid },

    /// To the requester only; never broadcast.
    #[serde(rename = "board:error", rename_all = "camelCase")]
    Error { code: ErrorCode, message: String },
}

impl ServerEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    /// Encode to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode a text frame (used by clients and tests).
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Encode(e) => write!(f, "Encode error: {e}"),
            ProtocolError::Decode(e) => write!(f, "Decode error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

//! Connection sessions: who is on which board, per socket.
//!
//! The registry is an explicit collaborator injected into the server,
//! not process-global state. Each WebSocket connection registers exactly
//! one session after a successful join; membership checks for every
//! subsequent event resolve through it.

use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

/// One authenticated connection bound to a board.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSession {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
    pub board_id: String,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<Uuid, ConnectionSession>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to a board. Re-registering replaces the prior
    /// binding (a client may re-join to switch boards on one socket).
    pub async fn register(&self, session: ConnectionSession) {
        self.sessions
            .write()
            .await
            .insert(session.connection_id, session);
    }

    pub async fn unregister(&self, connection_id: &Uuid) -> Option<ConnectionSession> {
        self.sessions.write().await.remove(connection_id)
    }

    /// Look up the session for a connection. The event loop's membership
    /// gate resolves through this on every post-join event.
    pub async fn get(&self, connection_id: &Uuid) -> Option<ConnectionSession> {
        self.sessions.read().await.get(connection_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

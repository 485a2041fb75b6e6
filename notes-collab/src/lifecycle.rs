//! Connection lifecycle: connect → join → leave/disconnect.
//!
//! Each connection is an explicit state machine:
//! ```text
//!              on_join(s)               on_join(t), t != s
//! Connected ──────────────► Joined(s) ──────────────────────► Joined(t)
//!     ▲                        │            (leaves s first)
//!     └──── on_leave(s) ───────┘
//!
//! any state ── on_disconnect ──► Disconnected (entry removed)
//! ```
//!
//! The current session is stored on the connection itself, so disconnect
//! cleanup is a direct lookup rather than a scan over every session.
//! Events for one connection are expected to be dispatched sequentially
//! (the server runs one task per connection); different connections are
//! handled concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::debounce::PersistenceDebouncer;
use crate::protocol::{ConnectionId, SessionId};
use crate::registry::SessionRegistry;
use crate::relay::{BroadcastRelay, PeerHandle, PeerReceiver, Presence};
use crate::store::{Document, StoreError};

/// Default capacity of each connection's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Joined(SessionId),
    Disconnected,
}

/// Result of [`LifecycleManager::on_join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Joined; `count` is the member count right after the join.
    Joined { count: usize },
    /// Already a member of that session; nothing was emitted.
    AlreadyJoined,
    /// No such connection (never connected or already disconnected).
    Unknown,
}

/// A freshly accepted connection.
pub struct Connection {
    pub id: ConnectionId,
    /// Everything the relay queues for this connection.
    pub events: PeerReceiver,
}

struct ConnectionEntry {
    state: ConnectionState,
    handle: PeerHandle,
}

/// Owns per-connection state and drives the registry, relay and debouncer.
pub struct LifecycleManager {
    registry: Arc<SessionRegistry>,
    relay: Arc<BroadcastRelay>,
    debouncer: PersistenceDebouncer,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    outbound_capacity: usize,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<SessionRegistry>,
        relay: Arc<BroadcastRelay>,
        debouncer: PersistenceDebouncer,
        outbound_capacity: usize,
    ) -> Self {
        Self {
            registry,
            relay,
            debouncer,
            connections: RwLock::new(HashMap::new()),
            outbound_capacity,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn relay(&self) -> &Arc<BroadcastRelay> {
        &self.relay
    }

    pub fn debouncer(&self) -> &PersistenceDebouncer {
        &self.debouncer
    }

    /// Allocate lifecycle state for a new transport link. No membership yet.
    pub async fn on_connect(&self) -> Connection {
        let id = Uuid::new_v4();
        let (handle, events) = PeerHandle::channel(id, self.outbound_capacity);
        self.connections.write().await.insert(
            id,
            ConnectionEntry {
                state: ConnectionState::Connected,
                handle,
            },
        );
        log::debug!("Connection {id} opened");
        Connection { id, events }
    }

    /// Join a session, leaving the current one first if it differs.
    pub async fn on_join(&self, conn: ConnectionId, session_id: &str) -> JoinOutcome {
        let Some((state, handle)) = self.snapshot(conn).await else {
            return JoinOutcome::Unknown;
        };

        match state {
            ConnectionState::Joined(current) if current == session_id => {
                return JoinOutcome::AlreadyJoined;
            }
            ConnectionState::Joined(previous) => {
                self.depart(conn, &previous).await;
            }
            _ => {}
        }

        let count = self.registry.join(session_id, handle).await;
        self.set_state(conn, ConnectionState::Joined(session_id.to_string()))
            .await;

        self.relay
            .broadcast_presence(session_id, conn, Presence::Joined)
            .await;
        self.relay
            .broadcast_presence(session_id, conn, Presence::ActiveCount)
            .await;

        log::info!("Connection {conn} joined {session_id} ({count} active)");
        JoinOutcome::Joined { count }
    }

    /// Leave the named session. Returns `false` if the connection was not in it.
    pub async fn on_leave(&self, conn: ConnectionId, session_id: &str) -> bool {
        match self.snapshot(conn).await {
            Some((ConnectionState::Joined(current), _)) if current == session_id => {
                self.depart(conn, session_id).await;
                self.set_state(conn, ConnectionState::Connected).await;
                true
            }
            _ => {
                log::debug!("Connection {conn} left {session_id} without being a member");
                false
            }
        }
    }

    /// Relay an edit and schedule its persistence.
    ///
    /// Returns the number of peers the edit was queued for, or `None` when
    /// the connection has not joined a session.
    pub async fn on_edit(&self, conn: ConnectionId, content: &str) -> Option<usize> {
        let Some((ConnectionState::Joined(session_id), _)) = self.snapshot(conn).await else {
            log::debug!("Ignoring edit from {conn}: not in a session");
            return None;
        };

        let delivered = self.relay.broadcast_update(&session_id, conn, content).await;
        self.debouncer.note_edit(&session_id, content).await;
        Some(delivered)
    }

    /// Persist the current session's pending content immediately.
    ///
    /// `None` when the connection has not joined a session.
    pub async fn on_save(&self, conn: ConnectionId) -> Option<(SessionId, Result<bool, StoreError>)> {
        let Some((ConnectionState::Joined(session_id), _)) = self.snapshot(conn).await else {
            return None;
        };
        let result = self.debouncer.flush_now(&session_id).await;
        Some((session_id, result))
    }

    /// Create an empty note whose id can then be joined.
    pub async fn on_create(&self, title: &str) -> Result<Document, StoreError> {
        let document = self.debouncer.store().create_document(title).await?;
        log::info!("Created document {}", document.id);
        Ok(document)
    }

    /// Load a note. Content still waiting for its quiet interval wins over
    /// what the store holds.
    pub async fn on_open(&self, session_id: &str) -> Result<Document, StoreError> {
        let mut document = self.debouncer.store().get_document(session_id).await?;
        if let Some(content) = self.debouncer.pending_content(session_id).await {
            document.content = content;
        }
        Ok(document)
    }

    /// Tear down a connection. Safe to call more than once.
    pub async fn on_disconnect(&self, conn: ConnectionId) {
        let Some(entry) = self.connections.write().await.remove(&conn) else {
            return;
        };
        if let ConnectionState::Joined(session_id) = entry.state {
            self.depart(conn, &session_id).await;
        }
        log::debug!("Connection {conn} closed");
    }

    /// Current lifecycle state; `Disconnected` for unknown ids.
    pub async fn state(&self, conn: ConnectionId) -> ConnectionState {
        self.connections
            .read()
            .await
            .get(&conn)
            .map(|entry| entry.state.clone())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Remove `conn` from `session_id` and tell whoever is left.
    async fn depart(&self, conn: ConnectionId, session_id: &str) {
        let Some(remaining) = self.registry.leave(session_id, conn).await else {
            return;
        };
        if remaining > 0 {
            self.relay
                .broadcast_presence(session_id, conn, Presence::Left)
                .await;
            self.relay
                .broadcast_presence(session_id, conn, Presence::ActiveCount)
                .await;
        }
        log::info!("Connection {conn} left {session_id} ({remaining} active)");
    }

    async fn snapshot(&self, conn: ConnectionId) -> Option<(ConnectionState, PeerHandle)> {
        self.connections
            .read()
            .await
            .get(&conn)
            .map(|entry| (entry.state.clone(), entry.handle.clone()))
    }

    async fn set_state(&self, conn: ConnectionId, state: ConnectionState) {
        if let Some(entry) = self.connections.write().await.get_mut(&conn) {
            entry.state = state;
        }
    }
}

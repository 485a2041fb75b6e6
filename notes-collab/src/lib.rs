//! # notes-collab: Real-time relay for collaborative notes
//!
//! Editors viewing the same note join a session keyed by the note's id.
//! Every edit is relayed to the other viewers of that note and persisted
//! after a quiet interval.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌──────────────────┐
//! │ RelayClient │ ◄─────────────────► │ RelayServer      │
//! │ (per user)  │     Binary Proto    │ LifecycleManager │
//! └─────────────┘                     └────────┬─────────┘
//!                          ┌───────────────────┼───────────────────┐
//!                          ▼                   ▼                   ▼
//!                  SessionRegistry      BroadcastRelay    PersistenceDebouncer
//!                  (presence)           (fan-out)         (quiet-interval writes)
//!                                                                  │
//!                                                                  ▼
//!                                                          DocumentStore
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded messages)
//! - [`lifecycle`]: Per-connection state machine
//! - [`registry`]: Session membership
//! - [`relay`]: Fan-out with backpressure
//! - [`debounce`]: Debounced persistence
//! - [`store`]: Document storage (in-memory, RocksDB)
//! - [`server`]: WebSocket relay server
//! - [`client`]: WebSocket client

pub mod client;
pub mod debounce;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod store;

#[cfg(test)]
mod test_helpers;

// Re-exports for convenience
pub use client::{ClientEvent, RelayClient};
pub use debounce::{DebounceStats, PersistenceDebouncer, DEFAULT_SAVE_DELAY};
pub use error::{Error, Result};
pub use lifecycle::{Connection, ConnectionState, JoinOutcome, LifecycleManager};
pub use protocol::{
    ClientMessage, ConnectionId, ProtocolError, ServerEvent, ServerMessage, SessionId,
    MAX_FRAME_BYTES,
};
pub use registry::{Session, SessionRegistry};
pub use relay::{BroadcastRelay, PeerHandle, PeerReceiver, Presence, RelayStats};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use store::{Document, DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};

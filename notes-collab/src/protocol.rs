//! Binary protocol spoken between editors and the relay.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded message:
//! ```text
//! editor ── ClientMessage ──► relay        (join / edit / leave / save / ping)
//! editor ◄── ServerMessage ── relay        (session id + ServerEvent)
//! ```
//!
//! Content is an opaque UTF-8 snapshot of the whole note. The relay never
//! merges edits; whatever arrives last wins on each peer's buffer.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::Document;

/// Opaque document id used as the session key.
pub type SessionId = String;

/// Transport-assigned identifier, unique for the lifetime of one link.
pub type ConnectionId = Uuid;

/// Largest frame the relay will decode. Length prefixes claiming more than
/// this are rejected before anything is allocated.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Messages sent by an editor to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Start viewing a document. Joining a second document leaves the first.
    Join { session_id: SessionId },
    /// Full content of the local buffer after an edit.
    Edit { content: String },
    /// Stop viewing a document.
    Leave { session_id: SessionId },
    /// Persist the pending content of the current document right away.
    Save,
    /// Heartbeat ping
    Ping,
    /// Create an empty note; answered with `Created`.
    Create { title: String },
    /// Load a note; answered with `Opened`, including unsaved content.
    Open { session_id: SessionId },
}

/// Events delivered by the relay to an editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Another participant changed the document.
    PeerEdit { content: String },
    /// Someone joined. Presence is anonymous: no identity is attached.
    PeerJoined,
    /// Someone left.
    PeerLeft,
    /// Number of connections currently viewing the document.
    ActiveCount(usize),
    /// An explicit save completed (or there was nothing to save).
    Saved,
    /// An explicit save failed; the content stays pending.
    SaveFailed { reason: String },
    /// Heartbeat pong
    Pong,
    /// Reply to `Create`.
    Created(Document),
    /// Reply to `Open`.
    Opened(Document),
    /// `Create` or `Open` failed.
    RequestFailed { reason: String },
}

/// Envelope for everything the relay sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    /// Session the event belongs to (`None` for connection-level replies).
    pub session_id: Option<SessionId>,
    pub event: ServerEvent,
}

impl ServerMessage {
    /// Event scoped to a session.
    pub fn session(session_id: impl Into<SessionId>, event: ServerEvent) -> Self {
        Self {
            session_id: Some(session_id.into()),
            event,
        }
    }

    /// Connection-level event (pong, save result without a session).
    pub fn direct(event: ServerEvent) -> Self {
        Self {
            session_id: None,
            event,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ClientMessage {
    pub fn join(session_id: impl Into<SessionId>) -> Self {
        Self::Join {
            session_id: session_id.into(),
        }
    }

    pub fn edit(content: impl Into<String>) -> Self {
        Self::Edit {
            content: content.into(),
        }
    }

    pub fn leave(session_id: impl Into<SessionId>) -> Self {
        Self::Leave {
            session_id: session_id.into(),
        }
    }

    pub fn create(title: impl Into<String>) -> Self {
        Self::Create {
            title: title.into(),
        }
    }

    pub fn open(session_id: impl Into<SessionId>) -> Self {
        Self::Open {
            session_id: session_id.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let config = bincode::config::standard().with_limit::<MAX_FRAME_BYTES>();
    let (value, _) = bincode::serde::decode_from_slice(bytes, config)
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

//! Persistent document storage.
//!
//! The relay only ever overwrites the content of an existing document; the
//! create and fetch operations exist for the CRUD layer and for tests.
//!
//! ```text
//! ┌─────────────────────┐  overwrite_content  ┌──────────────────┐
//! │ PersistenceDebouncer│ ──────────────────► │ dyn DocumentStore│
//! └─────────────────────┘                     └────────┬─────────┘
//!                                                      │
//!                                       ┌──────────────┴─────────────┐
//!                                       ▼                            ▼
//!                                 MemoryStore                  RocksStore
//!                               (HashMap, tests)     (CF "documents", LZ4)
//! ```

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;

/// A note as held by the persistent store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    /// Milliseconds since the unix epoch
    pub created_at: u64,
    /// Milliseconds since the unix epoch, bumped on every overwrite
    pub updated_at: u64,
}

impl Document {
    /// New, empty document with a fresh v4 id.
    pub fn new(title: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            content: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the content and bump `updated_at`.
    pub fn overwrite(&mut self, content: &str) {
        self.content.clear();
        self.content.push_str(content);
        // Keep updated_at monotonic even if the wall clock steps back.
        self.updated_at = now_millis().max(self.updated_at);
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether a later attempt with the same input can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::NotFound(_))
    }
}

/// Interface of the persistent store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create an empty document with the given title.
    async fn create_document(&self, title: &str) -> Result<Document, StoreError>;

    /// Fetch a document by id.
    async fn get_document(&self, id: &str) -> Result<Document, StoreError>;

    /// Replace the content of an existing document, returning the updated record.
    async fn overwrite_content(&self, id: &str, content: &str) -> Result<Document, StoreError>;
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

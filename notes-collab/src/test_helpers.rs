//! Shared fixtures for unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::store::{Document, DocumentStore, StoreError};

/// Store that records every overwrite and can be told to fail.
#[derive(Default)]
pub struct RecordingStore {
    writes: Mutex<Vec<(String, String)>>,
    errors: Mutex<VecDeque<StoreError>>,
    latency: Duration,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every overwrite takes `latency` before it lands.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Make the next overwrite fail with `error`. Calls stack up in order.
    pub fn fail_next(&self, error: StoreError) {
        self.errors.lock().unwrap().push_back(error);
    }

    /// Every successful `(id, content)` overwrite, in order.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentStore for RecordingStore {
    async fn create_document(&self, title: &str) -> Result<Document, StoreError> {
        Ok(Document::new(title))
    }

    async fn get_document(&self, id: &str) -> Result<Document, StoreError> {
        Err(StoreError::NotFound(id.to_string()))
    }

    async fn overwrite_content(&self, id: &str, content: &str) -> Result<Document, StoreError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(error) = self.errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.writes
            .lock()
            .unwrap()
            .push((id.to_string(), content.to_string()));

        let mut document = Document::new("");
        document.id = id.to_string();
        document.overwrite(content);
        Ok(document)
    }
}

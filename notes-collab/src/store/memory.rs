//! In-memory document store.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{Document, DocumentStore, StoreError};

/// `HashMap`-backed store. Used when no storage path is configured.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document with a caller-chosen id (fixtures, imports).
    pub async fn insert(&self, document: Document) {
        self.documents
            .write()
            .await
            .insert(document.id.clone(), document);
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_document(&self, title: &str) -> Result<Document, StoreError> {
        let document = Document::new(title);
        self.insert(document.clone()).await;
        Ok(document)
    }

    async fn get_document(&self, id: &str) -> Result<Document, StoreError> {
        self.documents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn overwrite_content(&self, id: &str, content: &str) -> Result<Document, StoreError> {
        let mut documents = self.documents.write().await;
        let document = documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        document.overwrite(content);
        Ok(document.clone())
    }
}

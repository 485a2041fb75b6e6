//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: one record per note, keyed by the UTF-8 document id.
//!   Values are bincode-encoded [`Document`]s, LZ4 compressed with the
//!   uncompressed size prepended.
//!
//! RocksDB calls are blocking, so every operation hops onto the blocking
//! thread pool via `spawn_blocking`.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{Document, DocumentStore, StoreError};

const CF_DOCUMENTS: &str = "documents";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("notes_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, given directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

struct Inner {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serialises read-modify-write of a record.
    write_lock: Mutex<()>,
}

/// RocksDB document store.
#[derive(Clone)]
pub struct RocksStore {
    inner: Arc<Inner>,
}

impl RocksStore {
    /// Open (or create) the database at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);

        let mut cf_opts = Options::default();
        cf_opts.set_block_based_table_factory(&block_opts);
        // Values are already LZ4 compressed.
        cf_opts.set_compression_type(DBCompressionType::None);
        cf_opts.set_write_buffer_size(config.write_buffer_size);
        cf_opts.optimize_for_point_lookup(config.block_cache_size as u64);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_DOCUMENTS, cf_opts)],
        )?;

        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                config,
                write_lock: Mutex::new(()),
            }),
        })
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    /// List all document ids.
    pub async fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        self.blocking(|inner| {
            let cf = inner.cf()?;
            let mut ids = Vec::new();
            for item in inner.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                let id = String::from_utf8(key.to_vec())
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                ids.push(id);
            }
            Ok(ids)
        })
        .await
    }

    /// Delete a document. Deleting a missing id is not an error.
    pub async fn delete_document(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.blocking(move |inner| {
            let cf = inner.cf()?;
            inner.db.delete_cf_opt(cf, id.as_bytes(), &inner.write_options())?;
            Ok(())
        })
        .await
    }

    /// Flush memtables to disk.
    pub async fn sync(&self) -> Result<(), StoreError> {
        self.blocking(|inner| Ok(inner.db.flush()?)).await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }
}

impl Inner {
    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_DOCUMENTS)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_DOCUMENTS}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn load(&self, id: &str) -> Result<Document, StoreError> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => decode_record(&bytes),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    fn save(&self, document: &Document) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let record = encode_record(document)?;
        self.db
            .put_cf_opt(cf, document.id.as_bytes(), &record, &self.write_options())?;
        Ok(())
    }
}

fn encode_record(document: &Document) -> Result<Vec<u8>, StoreError> {
    let encoded = bincode::serde::encode_to_vec(document, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&encoded))
}

fn decode_record(bytes: &[u8]) -> Result<Document, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let (document, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(document)
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn create_document(&self, title: &str) -> Result<Document, StoreError> {
        let document = Document::new(title);
        let saved = document.clone();
        self.blocking(move |inner| inner.save(&saved)).await?;
        Ok(document)
    }

    async fn get_document(&self, id: &str) -> Result<Document, StoreError> {
        let id = id.to_string();
        self.blocking(move |inner| inner.load(&id)).await
    }

    async fn overwrite_content(&self, id: &str, content: &str) -> Result<Document, StoreError> {
        let id = id.to_string();
        let content = content.to_string();
        self.blocking(move |inner| {
            let _guard = inner
                .write_lock
                .lock()
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            let mut document = inner.load(&id)?;
            document.overwrite(&content);
            inner.save(&document)?;
            Ok(document)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert!(store.list_documents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_get_overwrite() {
        let (_dir, store) = open_temp();

        let doc = store.create_document("Standup").await.unwrap();
        assert_eq!(store.get_document(&doc.id).await.unwrap(), doc);

        let updated = store.overwrite_content(&doc.id, "- shipped relay").await.unwrap();
        assert_eq!(updated.content, "- shipped relay");
        assert_eq!(updated.title, "Standup");
        assert_eq!(
            store.get_document(&doc.id).await.unwrap().content,
            "- shipped relay"
        );
    }

    #[tokio::test]
    async fn test_overwrite_missing_document() {
        let (_dir, store) = open_temp();
        let result = store.overwrite_content("ghost", "boo").await;
        assert_eq!(result, Err(StoreError::NotFound("ghost".into())));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (_dir, store) = open_temp();
        let a = store.create_document("a").await.unwrap();
        let b = store.create_document("b").await.unwrap();

        let ids = store.list_documents().await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id) && ids.contains(&b.id));

        store.delete_document(&a.id).await.unwrap();
        assert!(matches!(
            store.get_document(&a.id).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.list_documents().await.unwrap(), vec![b.id]);
    }

    #[tokio::test]
    async fn test_reopen_keeps_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");

        let id = {
            let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
            let doc = store.create_document("persist me").await.unwrap();
            store.overwrite_content(&doc.id, "still here").await.unwrap();
            store.sync().await.unwrap();
            doc.id
        };

        let reopened = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        let doc = reopened.get_document(&id).await.unwrap();
        assert_eq!(doc.content, "still here");
    }

    #[test]
    fn test_record_compresses_repetitive_content() {
        let mut doc = Document::new("big");
        doc.overwrite(&"lorem ipsum ".repeat(1000));
        let record = encode_record(&doc).unwrap();
        assert!(record.len() < doc.content.len() / 4);
        assert_eq!(decode_record(&record).unwrap(), doc);
    }

    #[test]
    fn test_corrupt_record() {
        assert!(matches!(
            decode_record(&[1, 0, 0, 0, 0xFF]),
            Err(StoreError::Compression(_))
        ));
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("notes_data"));
        assert!(!config.sync_writes);
        assert_eq!(config.bloom_filter_bits, 10);
    }
}

//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`: Full Yrs replica state (LZ4 compressed), keyed by document id
//! - `snapshots`: Plain report projection (JSON, LZ4 compressed)
//! - `metadata`: Document metadata (bincode: version, sizes, timestamps)
//! - `comments`: Annotations, keyed by `<document id>\0<sequence:8 bytes BE>`
//!
//! A save writes replica, snapshot and metadata in one atomic batch so a
//! crash never leaves a replica without its matching projection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::future::{BoxFuture, FutureExt};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{
    AnnotationSink, CommentRecord, NewComment, PersistedDocument, PersistenceError,
    PersistenceGateway,
};
use crate::ids::{now_millis, DocumentId};
use crate::schema::ReportDocument;

const CF_DOCUMENTS: &str = "documents";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";
const CF_COMMENTS: &str = "comments";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_SNAPSHOTS, CF_METADATA, CF_COMMENTS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: true, saves are infrequent)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("audit_collab_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Document metadata stored alongside each save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: DocumentId,
    /// Number of saves so far (monotonically increasing)
    pub version: u64,
    /// Uncompressed replica size in bytes
    pub replica_size: u64,
    /// Compressed replica size in bytes
    pub compressed_size: u64,
    pub comment_count: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(document_id: DocumentId) -> Self {
        let now = now_secs();
        Self {
            document_id,
            version: 0,
            replica_size: 0,
            compressed_size: 0,
            comment_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Document not found
    NotFound(DocumentId),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Global sequence number for comment keys
    comment_sequence: AtomicU64,
}

impl DocumentStore {
    /// Open the document store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let comment_sequence = Self::recover_comment_sequence(&db);

        Ok(Self {
            db,
            config,
            comment_sequence: AtomicU64::new(comment_sequence),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_SNAPSHOTS => {
                // Values are already LZ4 compressed by us
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_COMMENTS => {
                // Prefix-scanned per document
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    /// Highest comment sequence in use, plus one.
    fn recover_comment_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let Some(cf) = db.cf_handle(CF_COMMENTS) else {
            return 0;
        };
        db.iterator_cf(&cf, IteratorMode::Start)
            .filter_map(Result::ok)
            .filter_map(|(key, _)| comment_sequence_of(&key))
            .max()
            .map_or(0, |seq| seq + 1)
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Save the replica and its plain projection atomically.
    pub fn save_document(
        &self,
        document_id: &DocumentId,
        replica: &[u8],
        content: &ReportDocument,
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(replica);
        let content_json = serde_json::to_vec(content)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed_content = lz4_flex::compress_prepend_size(&content_json);

        let mut meta = match self.load_metadata(document_id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => DocumentMetadata::new(document_id.clone()),
            Err(e) => return Err(e),
        };
        meta.version += 1;
        meta.replica_size = replica.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let key = document_id.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, key, &compressed);
        batch.put_cf(&cf_snapshots, key, &compressed_content);
        batch.put_cf(&cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load whatever is stored for a document. Missing parts are `None`.
    pub fn load_document(&self, document_id: &DocumentId) -> Result<PersistedDocument, StoreError> {
        let key = document_id.as_str().as_bytes();

        let binary_replica = match self.db.get_cf(&self.cf(CF_DOCUMENTS)?, key)? {
            Some(compressed) => Some(
                lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?,
            ),
            None => None,
        };

        let plain_snapshot = match self.db.get_cf(&self.cf(CF_SNAPSHOTS)?, key)? {
            Some(compressed) => {
                let json = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                Some(
                    serde_json::from_slice(&json)
                        .map_err(|e| StoreError::DeserializationError(e.to_string()))?,
                )
            }
            None => None,
        };

        Ok(PersistedDocument {
            binary_replica,
            plain_snapshot,
        })
    }

    /// Store a plain snapshot without a replica (used by importers and tests).
    pub fn put_snapshot(
        &self,
        document_id: &DocumentId,
        content: &ReportDocument,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_vec(content)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);
        self.db
            .put_cf(&self.cf(CF_SNAPSHOTS)?, document_id.as_str().as_bytes(), compressed)?;
        Ok(())
    }

    pub fn document_exists(&self, document_id: &DocumentId) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, document_id.as_str().as_bytes())?.is_some())
    }

    pub fn load_metadata(&self, document_id: &DocumentId) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, document_id.as_str().as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(document_id.clone())),
        }
    }

    /// List all document ids that have been saved at least once.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = std::str::from_utf8(&key)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            ids.push(DocumentId::new(id));
        }
        Ok(ids)
    }

    /// Delete a document, its projection, metadata and comments.
    pub fn delete_document(&self, document_id: &DocumentId) -> Result<(), StoreError> {
        let key = document_id.as_str().as_bytes();
        let cf_comments = self.cf(CF_COMMENTS)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_DOCUMENTS)?, key);
        batch.delete_cf(&self.cf(CF_SNAPSHOTS)?, key);
        batch.delete_cf(&self.cf(CF_METADATA)?, key);

        let prefix = comment_prefix(document_id);
        let iter = self.db.iterator_cf(
            &cf_comments,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(&cf_comments, &key);
        }

        self.db.write(batch)?;
        Ok(())
    }

    // ─── Comments ─────────────────────────────────────────────────────

    pub fn append_comment(
        &self,
        document_id: &DocumentId,
        record: &CommentRecord,
    ) -> Result<u64, StoreError> {
        let cf_comments = self.cf(CF_COMMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let seq = self.comment_sequence.fetch_add(1, Ordering::SeqCst);

        let mut key = comment_prefix(document_id);
        key.extend_from_slice(&seq.to_be_bytes());
        let value = bincode::serde::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        let mut meta = match self.load_metadata(document_id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => DocumentMetadata::new(document_id.clone()),
            Err(e) => return Err(e),
        };
        meta.comment_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_comments, &key, &value);
        batch.put_cf(&cf_meta, document_id.as_str().as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(seq)
    }

    /// All comments of a document, in insertion order.
    pub fn comments(&self, document_id: &DocumentId) -> Result<Vec<CommentRecord>, StoreError> {
        let cf = self.cf(CF_COMMENTS)?;
        let prefix = comment_prefix(document_id);

        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let (record, _) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

fn comment_prefix(document_id: &DocumentId) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(document_id.as_str().len() + 9);
    prefix.extend_from_slice(document_id.as_str().as_bytes());
    prefix.push(0);
    prefix
}

fn comment_sequence_of(key: &[u8]) -> Option<u64> {
    let tail = key.len().checked_sub(8)?;
    let bytes: [u8; 8] = key[tail..].try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

/// [`PersistenceGateway`] over a [`DocumentStore`].
///
/// RocksDB calls block, so every operation runs on tokio's blocking pool.
#[derive(Clone)]
pub struct RocksGateway {
    store: Arc<DocumentStore>,
}

impl RocksGateway {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(DocumentStore::open(config)?)))
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&DocumentStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?
            .map_err(PersistenceError::from)
    }
}

impl PersistenceGateway for RocksGateway {
    fn load<'a>(
        &'a self,
        document_id: &'a DocumentId,
    ) -> BoxFuture<'a, Result<PersistedDocument, PersistenceError>> {
        let id = document_id.clone();
        self.blocking(move |store| store.load_document(&id)).boxed()
    }

    fn save<'a>(
        &'a self,
        document_id: &'a DocumentId,
        binary_replica: Vec<u8>,
        content: ReportDocument,
    ) -> BoxFuture<'a, Result<(), PersistenceError>> {
        let id = document_id.clone();
        self.blocking(move |store| {
            let meta = store.save_document(&id, &binary_replica, &content)?;
            log::debug!(
                "Saved document {id} v{} ({} → {} bytes)",
                meta.version,
                meta.replica_size,
                meta.compressed_size
            );
            Ok(())
        })
        .boxed()
    }
}

impl AnnotationSink for RocksGateway {
    fn record<'a>(
        &'a self,
        document_id: &'a DocumentId,
        comment: NewComment,
    ) -> BoxFuture<'a, Result<CommentRecord, PersistenceError>> {
        let record = CommentRecord::new(document_id.clone(), comment, now_millis());
        let id = document_id.clone();
        self.blocking(move |store| {
            store.append_comment(&id, &record)?;
            Ok(record)
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;
    use crate::schema::Section;

    fn open_store(dir: &tempfile::TempDir) -> DocumentStore {
        DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    fn report() -> ReportDocument {
        ReportDocument::new("Inventory count observation")
            .with_field("client", "Northwind")
            .with_section(Section::new("s1", "Procedures", "Test counts at two sites."))
    }

    fn comment(text: &str) -> NewComment {
        NewComment {
            author: UserId::from("alice"),
            author_name: "Alice".into(),
            text: text.into(),
            position: None,
        }
    }

    #[test]
    fn test_store_open_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        assert!(store.path().exists());
    }

    #[test]
    fn test_save_load_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let doc = DocumentId::from("D1");
        let replica = b"replica bytes that are long enough to be worth compressing".to_vec();

        let meta = store.save_document(&doc, &replica, &report()).unwrap();
        assert_eq!(meta.version, 1);
        assert_eq!(meta.replica_size, replica.len() as u64);

        let loaded = store.load_document(&doc).unwrap();
        assert_eq!(loaded.binary_replica, Some(replica));
        assert_eq!(loaded.plain_snapshot, Some(report()));
    }

    #[test]
    fn test_load_missing_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let loaded = store.load_document(&DocumentId::from("nope")).unwrap();
        assert_eq!(loaded, PersistedDocument::default());
        assert!(matches!(
            store.load_metadata(&DocumentId::from("nope")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_snapshot_only_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let doc = DocumentId::from("imported");
        store.put_snapshot(&doc, &report()).unwrap();

        let loaded = store.load_document(&doc).unwrap();
        assert!(loaded.binary_replica.is_none());
        assert_eq!(loaded.plain_snapshot, Some(report()));
    }

    #[test]
    fn test_version_increments_per_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let doc = DocumentId::from("D1");
        for _ in 0..3 {
            store.save_document(&doc, b"x", &report()).unwrap();
        }
        let meta = store.load_metadata(&doc).unwrap();
        assert_eq!(meta.version, 3);
        assert!(meta.updated_at >= meta.created_at);
    }

    #[test]
    fn test_list_and_delete_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let ids = ["a", "b", "c"].map(DocumentId::from);
        for id in &ids {
            store.save_document(id, b"state", &report()).unwrap();
        }
        store.append_comment(&ids[1], &CommentRecord::new(ids[1].clone(), comment("x"), 1)).unwrap();

        let listed = store.list_documents().unwrap();
        assert_eq!(listed.len(), 3);

        store.delete_document(&ids[1]).unwrap();
        assert!(!store.document_exists(&ids[1]).unwrap());
        assert!(store.comments(&ids[1]).unwrap().is_empty());
        assert!(store.document_exists(&ids[0]).unwrap());
    }

    #[test]
    fn test_comments_isolated_per_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let a = DocumentId::from("doc");
        // "doc\0" must not be confused with a document named "doc2"
        let b = DocumentId::from("doc2");

        for text in ["first", "second"] {
            store.append_comment(&a, &CommentRecord::new(a.clone(), comment(text), 1)).unwrap();
        }
        store.append_comment(&b, &CommentRecord::new(b.clone(), comment("other"), 1)).unwrap();

        let texts: Vec<String> = store.comments(&a).unwrap().into_iter().map(|c| c.text).collect();
        assert_eq!(texts, vec!["first", "second"]);
        assert_eq!(store.comments(&b).unwrap().len(), 1);
        assert_eq!(store.load_metadata(&a).unwrap().comment_count, 2);
    }

    #[test]
    fn test_comment_sequence_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let doc = DocumentId::from("D1");
        {
            let store = open_store(&dir);
            for _ in 0..3 {
                store.append_comment(&doc, &CommentRecord::new(doc.clone(), comment("c"), 1)).unwrap();
            }
        }
        let store = open_store(&dir);
        let seq = store
            .append_comment(&doc, &CommentRecord::new(doc.clone(), comment("after restart"), 1))
            .unwrap();
        assert_eq!(seq, 3);
        assert_eq!(store.comments(&doc).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_gateway_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RocksGateway::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let doc = DocumentId::from("D1");

        gateway.save(&doc, vec![0, 0], report()).await.unwrap();
        let loaded = gateway.load(&doc).await.unwrap();
        assert_eq!(loaded.binary_replica, Some(vec![0, 0]));
        assert_eq!(loaded.plain_snapshot, Some(report()));

        let record = gateway.record(&doc, comment("Tie out to ledger")).await.unwrap();
        assert_eq!(gateway.store().comments(&doc).unwrap(), vec![record]);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound(DocumentId::from("D9"));
        assert!(err.to_string().contains("not found"));

        let err = StoreError::DatabaseError("test".into());
        assert!(err.to_string().contains("Database error"));
    }
}

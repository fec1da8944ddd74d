//! RocksDB-backed durable board store.
//!
//! This is the "relational store" collaborator behind the sync engine's
//! contract: `get_board_record(board_id) → { objects, version }` plus a
//! write-back that advances the version counter. Everything else about it
//! is opaque to the rest of the crate.
//!
//! Column families:
//! - `boards` — full board records (bincode, LZ4 compressed)
//! - `meta`   — per-board metadata (version, soft-delete flag, timestamps)
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

use tabula_core::BoardObject;

const CF_BOARDS: &str = "boards";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_BOARDS, CF_META];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tabula_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StorageConfig {
    /// Create config for testing (small caches, temp directory).
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

/// A board's durable contents: the authoritative object list and the
/// monotonically increasing version the write-back path advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardRecord {
    pub objects: Vec<BoardObject>,
    pub version: u64,
}

/// Per-board metadata kept next to the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardMeta {
    pub version: u64,
    pub object_count: u64,
    /// Soft-deleted boards stay on disk but read as NotFound.
    pub deleted: bool,
    /// Seconds since epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl BoardMeta {
    fn new() -> Self {
        let now = epoch_secs();
        Self {
            version: 0,
            object_count: 0,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// RocksDB internal error
    Database(String),
    /// Board absent or soft-deleted
    NotFound(String),
    /// Board already exists on create
    AlreadyExists(String),
    /// Serialization failed
    Serialization(String),
    /// Deserialization failed
    Deserialization(String),
    /// Compression error
    Compression(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Database(e) => write!(f, "Database error: {e}"),
            StorageError::NotFound(id) => write!(f, "Board not found: {id}"),
            StorageError::AlreadyExists(id) => write!(f, "Board already exists: {id}"),
            StorageError::Serialization(e) => write!(f, "Serialization error: {e}"),
            StorageError::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            StorageError::Compression(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn parallelism() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(2)
}

/// RocksDB-backed board record store.
pub struct BoardRecordStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StorageConfig,
}

impl BoardRecordStore {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(parallelism());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &StorageConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        // Board loads are point lookups by id
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("missing column family {name}")))
    }

    fn encode_record(record: &BoardRecord) -> Result<Vec<u8>, StorageError> {
        let raw = bincode::serde::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode_record(bytes: &[u8]) -> Result<BoardRecord, StorageError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StorageError::Compression(e.to_string()))?;
        let (record, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StorageError::Deserialization(e.to_string()))?;
        Ok(record)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Create a fresh, empty board at version 0.
    pub fn create_board(&self, board_id: &str) -> Result<(), StorageError> {
        if self.load_meta(board_id).is_ok() {
            return Err(StorageError::AlreadyExists(board_id.to_string()));
        }

        let record = BoardRecord {
            objects: Vec::new(),
            version: 0,
        };
        let meta = BoardMeta::new();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_BOARDS)?, board_id, Self::encode_record(&record)?);
        batch.put_cf(self.cf(CF_META)?, board_id, meta.encode()?);
        self.write_batch(batch)
    }

    /// The sync-engine contract: authoritative objects + version.
    ///
    /// Absent and soft-deleted boards both read as `NotFound`.
    pub fn get_board_record(&self, board_id: &str) -> Result<BoardRecord, StorageError> {
        let meta = self.load_meta(board_id)?;
        if meta.deleted {
            return Err(StorageError::NotFound(board_id.to_string()));
        }

        match self.db.get_cf(self.cf(CF_BOARDS)?, board_id)? {
            Some(bytes) => Self::decode_record(&bytes),
            None => Err(StorageError::NotFound(board_id.to_string())),
        }
    }

    /// Write back the current object list, advancing the version counter.
    /// Returns the new version.
    pub fn write_back(
        &self,
        board_id: &str,
        objects: &[BoardObject],
    ) -> Result<u64, StorageError> {
        let mut meta = self.load_meta(board_id)?;
        if meta.deleted {
            return Err(StorageError::NotFound(board_id.to_string()));
        }

        meta.version += 1;
        meta.object_count = objects.len() as u64;
        meta.updated_at = epoch_secs();

        let record = BoardRecord {
            objects: objects.to_vec(),
            version: meta.version,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_BOARDS)?, board_id, Self::encode_record(&record)?);
        batch.put_cf(self.cf(CF_META)?, board_id, meta.encode()?);
        self.write_batch(batch)?;

        Ok(meta.version)
    }

    /// Soft-delete a board: the record stays on disk, reads turn into
    /// `NotFound`. Triggered by the external board-lifecycle collaborator.
    pub fn soft_delete(&self, board_id: &str) -> Result<(), StorageError> {
        let mut meta = self.load_meta(board_id)?;
        meta.deleted = true;
        meta.updated_at = epoch_secs();
        self.db.put_cf(self.cf(CF_META)?, board_id, meta.encode()?)?;
        Ok(())
    }

    /// Per-board metadata.
    pub fn load_meta(&self, board_id: &str) -> Result<BoardMeta, StorageError> {
        match self.db.get_cf(self.cf(CF_META)?, board_id)? {
            Some(bytes) => BoardMeta::decode(&bytes),
            None => Err(StorageError::NotFound(board_id.to_string())),
        }
    }

    /// All live (non-deleted) board ids.
    pub fn list_boards(&self) -> Result<Vec<String>, StorageError> {
        let mut boards = Vec::new();
        let iter = self.db.iterator_cf(self.cf(CF_META)?, IteratorMode::Start);
        for item in iter {
            let (key, value) = item.map_err(|e| StorageError::Database(e.to_string()))?;
            let meta = BoardMeta::decode(&value)?;
            if !meta.deleted {
                boards.push(String::from_utf8_lossy(&key).into_owned());
            }
        }
        Ok(boards)
    }
}

//! RocksDB-backed snapshot store for relay rooms.
//!
//! Column families:
//! - `documents`: full yrs state per `(room, frame key)`, LZ4 compressed
//! - `metadata` : [`SnapshotMetadata`] per `(room, frame key)`, bincode
//!
//! Keys are `room ∥ 0x00 ∥ frame key`. Room names never contain NUL, so a
//! prefix scan on `room ∥ 0x00` lists exactly one room.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

const KEY_SEPARATOR: u8 = 0;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync every write
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_relay_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub room: String,
    pub key: String,
    /// Uncompressed size in bytes
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl SnapshotMetadata {
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    DatabaseError(String),
    NotFound { room: String, key: String },
    InvalidKey(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound { room, key } => write!(f, "Snapshot not found: {room}/{key}"),
            StoreError::InvalidKey(e) => write!(f, "Invalid key: {e}"),
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

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct SnapshotStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl SnapshotStore {
    /// Open (or create) the store and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Snapshot store opened at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(f64::from(config.bloom_filter_bits), false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Values are already LZ4 compressed.
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    fn db_key(room: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        if room.as_bytes().contains(&KEY_SEPARATOR) {
            return Err(StoreError::InvalidKey(format!("room {room:?} contains NUL")));
        }
        let mut out = Vec::with_capacity(room.len() + key.len() + 1);
        out.extend_from_slice(room.as_bytes());
        out.push(KEY_SEPARATOR);
        out.extend_from_slice(key.as_bytes());
        Ok(out)
    }

    fn split_key(raw: &[u8]) -> Option<(String, String)> {
        let at = raw.iter().position(|b| *b == KEY_SEPARATOR)?;
        let room = std::str::from_utf8(&raw[..at]).ok()?;
        let key = std::str::from_utf8(&raw[at + 1..]).ok()?;
        Some((room.to_string(), key.to_string()))
    }

    /// Save the full state of one document (snapshot + metadata, atomically).
    pub fn save_snapshot(
        &self,
        room: &str,
        key: &str,
        snapshot: &[u8],
    ) -> Result<SnapshotMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let db_key = Self::db_key(room, key)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);
        let now = now_secs();
        let meta = SnapshotMetadata {
            room: room.to_string(),
            key: key.to_string(),
            snapshot_size: snapshot.len() as u64,
            compressed_size: compressed.len() as u64,
            created_at: self.load_metadata(room, key).map_or(now, |m| m.created_at),
            updated_at: now,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, &db_key, &compressed);
        batch.put_cf(&cf_meta, &db_key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(meta)
    }

    pub fn load_snapshot(&self, room: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, Self::db_key(room, key)?)? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Err(StoreError::NotFound {
                room: room.to_string(),
                key: key.to_string(),
            }),
        }
    }

    pub fn load_metadata(&self, room: &str, key: &str) -> Result<SnapshotMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, Self::db_key(room, key)?)? {
            Some(bytes) => SnapshotMetadata::decode(&bytes),
            None => Err(StoreError::NotFound {
                room: room.to_string(),
                key: key.to_string(),
            }),
        }
    }

    /// Every `(key, snapshot)` saved for `room`.
    pub fn load_room(&self, room: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.keys_in_room(room)?
            .into_iter()
            .map(|key| {
                let snapshot = self.load_snapshot(room, &key)?;
                Ok((key, snapshot))
            })
            .collect()
    }

    pub fn keys_in_room(&self, room: &str) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let prefix = Self::db_key(room, "")?;
        let mut keys = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (raw, _) = item?;
            if !raw.starts_with(&prefix) {
                break;
            }
            if let Some((_, key)) = Self::split_key(&raw) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut rooms: Vec<String> = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (raw, _) = item?;
            let Some((room, _)) = Self::split_key(&raw) else {
                log::warn!("Skipping malformed snapshot key");
                continue;
            };
            if rooms.last() != Some(&room) {
                rooms.push(room);
            }
        }
        Ok(rooms)
    }

    pub fn delete_room(&self, room: &str) -> Result<usize, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let keys = self.keys_in_room(room)?;
        let mut batch = WriteBatch::default();
        for key in &keys {
            let db_key = Self::db_key(room, key)?;
            batch.delete_cf(&cf_docs, &db_key);
            batch.delete_cf(&cf_meta, &db_key);
        }
        self.db.write(batch)?;
        Ok(keys.len())
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

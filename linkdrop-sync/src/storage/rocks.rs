//! RocksDB-backed replica storage.
//!
//! Column families:
//! - `snapshots`: full document state per replica (LZ4 compressed)
//! - `updates`  : incremental updates, keyed `<replica:16><seq:8 BE>` (LZ4 compressed)
//! - `metadata` : per-replica bookkeeping (bincode)
//!
//! A replica is identified by a 16-byte key derived from the device name, so
//! one database can hold several local replicas side by side.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, SliceTransform, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_UPDATES, CF_METADATA];

/// Namespace for replica keys derived from device names.
const REPLICA_NAMESPACE: Uuid = Uuid::from_u128(0x6c69_6e6b_6472_6f70_8000_0000_0000_0001);

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
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("linkdrop_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
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

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn with_block_cache_size(mut self, bytes: usize) -> Self {
        self.block_cache_size = bytes;
        self
    }
}

/// Bookkeeping stored next to each replica's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMetadata {
    pub replica: Uuid,
    /// Sequence number the next appended update will get.
    pub next_seq: u64,
    /// Updates currently in the log.
    pub update_count: u64,
    /// Uncompressed size of the last snapshot.
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl ReplicaMetadata {
    fn new(replica: Uuid) -> Self {
        let now = now_secs();
        Self {
            replica,
            next_seq: 0,
            update_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
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

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("replica not found: {0}")]
    NotFound(Uuid),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Durable home of one or more replicas' document state.
///
/// Appends for one replica must be serialized by the caller; the persistence
/// flusher is the only writer in practice.
pub struct ReplicaStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl ReplicaStore {
    /// Open (or create) the database at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            descriptors,
        )?;
        log::debug!("Opened replica store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Payloads are already LZ4 framed.
            CF_SNAPSHOTS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Stable replica key for a device name.
    pub fn replica_key(device: &str) -> Uuid {
        Uuid::new_v5(&REPLICA_NAMESPACE, device.as_bytes())
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Store the full document state for `replica`.
    pub fn save_snapshot(&self, replica: Uuid, snapshot: &[u8]) -> Result<ReplicaMetadata, StorageError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);
        let mut meta = self.metadata_or_new(replica)?;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snap, replica.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, replica.as_bytes(), meta.encode()?);
        self.write(batch)?;

        Ok(meta)
    }

    /// Last stored snapshot, if any.
    pub fn load_snapshot(&self, replica: Uuid) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, replica.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StorageError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    // ─── Update log ───────────────────────────────────────────────────

    /// Append an update and return its sequence number.
    pub fn append_update(&self, replica: Uuid, update: &[u8]) -> Result<u64, StorageError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self.metadata_or_new(replica)?;
        let seq = meta.next_seq;
        meta.next_seq += 1;
        meta.update_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_updates,
            Self::update_key(replica, seq),
            lz4_flex::compress_prepend_size(update),
        );
        batch.put_cf(&cf_meta, replica.as_bytes(), meta.encode()?);
        self.write(batch)?;

        Ok(seq)
    }

    /// Updates with sequence number `>= since`, in sequence order.
    pub fn load_updates_since(
        &self,
        replica: Uuid,
        since: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>, StorageError> {
        let cf = self.cf(CF_UPDATES)?;
        let start = Self::update_key(replica, since);

        let mut updates = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            let Some(seq) = Self::seq_of(replica, &key) else {
                break;
            };
            let update = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StorageError::Compression(e.to_string()))?;
            updates.push((seq, update));
        }

        Ok(updates)
    }

    pub fn load_updates(&self, replica: Uuid) -> Result<Vec<(u64, Vec<u8>)>, StorageError> {
        self.load_updates_since(replica, 0)
    }

    /// Drop updates with sequence number `<= up_to`. Returns how many went.
    pub fn compact_updates(&self, replica: Uuid, up_to: u64) -> Result<u64, StorageError> {
        let cf = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let start = Self::update_key(replica, 0);

        let mut batch = WriteBatch::default();
        let mut removed = 0u64;
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, _) = item?;
            match Self::seq_of(replica, &key) {
                Some(seq) if seq <= up_to => {
                    batch.delete_cf(&cf, &key);
                    removed += 1;
                }
                _ => break,
            }
        }

        if removed > 0 {
            let mut meta = self.metadata_or_new(replica)?;
            meta.update_count = meta.update_count.saturating_sub(removed);
            meta.updated_at = now_secs();
            batch.put_cf(&cf_meta, replica.as_bytes(), meta.encode()?);
            self.write(batch)?;
        }

        Ok(removed)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, replica: Uuid) -> Result<ReplicaMetadata, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, replica.as_bytes())? {
            Some(bytes) => ReplicaMetadata::decode(&bytes),
            None => Err(StorageError::NotFound(replica)),
        }
    }

    pub fn list_replicas(&self) -> Result<Vec<Uuid>, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        let mut replicas = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Ok(bytes) = <[u8; 16]>::try_from(key.as_ref()) {
                replicas.push(Uuid::from_bytes(bytes));
            }
        }
        Ok(replicas)
    }

    /// Remove a replica's snapshot, updates and metadata.
    pub fn delete_replica(&self, replica: Uuid) -> Result<(), StorageError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_updates = self.cf(CF_UPDATES)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snap, replica.as_bytes());
        batch.delete_cf(&cf_meta, replica.as_bytes());
        batch.delete_range_cf(
            &cf_updates,
            Self::update_key(replica, 0),
            Self::update_key(replica, u64::MAX),
        );
        batch.delete_cf(&cf_updates, Self::update_key(replica, u64::MAX));
        self.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(&self.cf(name)?)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn metadata_or_new(&self, replica: Uuid) -> Result<ReplicaMetadata, StorageError> {
        match self.load_metadata(replica) {
            Ok(meta) => Ok(meta),
            Err(StorageError::NotFound(_)) => Ok(ReplicaMetadata::new(replica)),
            Err(e) => Err(e),
        }
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("column family '{name}' not found")))
    }

    fn update_key(replica: Uuid, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(replica.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    /// Sequence number of an update key belonging to `replica`.
    fn seq_of(replica: Uuid, key: &[u8]) -> Option<u64> {
        if key.len() != 24 || &key[..16] != replica.as_bytes() {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[16..]);
        Some(u64::from_be_bytes(buf))
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, ReplicaStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ReplicaStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_replica_key_is_stable() {
        let a = ReplicaStore::replica_key("laptop");
        assert_eq!(a, ReplicaStore::replica_key("laptop"));
        assert_ne!(a, ReplicaStore::replica_key("phone"));
        assert_eq!(a.as_bytes().len(), 16);
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let replica = ReplicaStore::replica_key("a");
        assert_eq!(store.load_snapshot(replica).unwrap(), None);

        let data = b"snapshot bytes that are long enough to be worth compressing".to_vec();
        let meta = store.save_snapshot(replica, &data).unwrap();
        assert_eq!(meta.snapshot_size, data.len() as u64);
        assert!(meta.compressed_size > 0);
        assert_eq!(store.load_snapshot(replica).unwrap(), Some(data));
    }

    #[test]
    fn test_updates_keep_sequence_order() {
        let (_dir, store) = open_temp();
        let replica = ReplicaStore::replica_key("a");

        for i in 0..12u8 {
            assert_eq!(store.append_update(replica, &[i; 8]).unwrap(), i as u64);
        }

        let all = store.load_updates(replica).unwrap();
        assert_eq!(all.len(), 12);
        assert_eq!(all[0], (0, vec![0; 8]));
        assert_eq!(all[11], (11, vec![11; 8]));

        let tail = store.load_updates_since(replica, 10).unwrap();
        assert_eq!(tail.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![10, 11]);
    }

    #[test]
    fn test_compact_updates() {
        let (_dir, store) = open_temp();
        let replica = ReplicaStore::replica_key("a");
        for i in 0..10u8 {
            store.append_update(replica, &[i]).unwrap();
        }

        assert_eq!(store.compact_updates(replica, 5).unwrap(), 6);
        let remaining = store.load_updates(replica).unwrap();
        assert_eq!(remaining.len(), 4);
        assert_eq!(remaining[0].0, 6);

        let meta = store.load_metadata(replica).unwrap();
        assert_eq!(meta.update_count, 4);
        assert_eq!(meta.next_seq, 10);
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let replica = ReplicaStore::replica_key("a");
        {
            let store = ReplicaStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.append_update(replica, b"one").unwrap();
            store.append_update(replica, b"two").unwrap();
        }
        let store = ReplicaStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.append_update(replica, b"three").unwrap(), 2);
        assert_eq!(store.load_updates(replica).unwrap().len(), 3);
    }

    #[test]
    fn test_replicas_are_isolated() {
        let (_dir, store) = open_temp();
        let a = ReplicaStore::replica_key("a");
        let b = ReplicaStore::replica_key("b");

        store.append_update(a, b"a0").unwrap();
        store.append_update(a, b"a1").unwrap();
        store.append_update(b, b"b0").unwrap();
        store.save_snapshot(b, b"snap-b").unwrap();

        assert_eq!(store.load_updates(a).unwrap().len(), 2);
        assert_eq!(store.load_updates(b).unwrap(), vec![(0, b"b0".to_vec())]);
        assert_eq!(store.load_snapshot(a).unwrap(), None);

        let mut listed = store.list_replicas().unwrap();
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[test]
    fn test_delete_replica() {
        let (_dir, store) = open_temp();
        let replica = ReplicaStore::replica_key("a");
        store.save_snapshot(replica, b"snap").unwrap();
        store.append_update(replica, b"u").unwrap();

        store.delete_replica(replica).unwrap();

        assert_eq!(store.load_snapshot(replica).unwrap(), None);
        assert!(store.load_updates(replica).unwrap().is_empty());
        assert!(matches!(store.load_metadata(replica), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_compression_ratio() {
        let (_dir, store) = open_temp();
        let replica = ReplicaStore::replica_key("a");
        let data = vec![7u8; 100_000];
        let meta = store.save_snapshot(replica, &data).unwrap();
        assert!(meta.compressed_size * 10 < meta.snapshot_size);
    }

    #[test]
    fn test_store_config_builders() {
        let config = StoreConfig::default()
            .with_path("/tmp/x")
            .with_sync_writes(true)
            .with_block_cache_size(1024);
        assert_eq!(config.path, PathBuf::from("/tmp/x"));
        assert!(config.sync_writes);
        assert_eq!(config.block_cache_size, 1024);
        assert_eq!(config.bloom_filter_bits, 10);
    }

    #[test]
    fn test_error_display() {
        let err = StorageError::NotFound(Uuid::nil());
        assert!(err.to_string().contains("not found"));
        assert!(StorageError::Database("x".into()).to_string().contains("database"));
    }
}

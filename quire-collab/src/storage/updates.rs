//! RocksDB-backed append-only log of document updates.
//!
//! Column families:
//! - `updates` : `path \0 seq(u64 BE)` → bincode `{update (LZ4), metadata, timestamp}`
//! - `meta`    : `version` (u32 BE) and `sequence` (u64 BE)
//!
//! Records for a path are read back in write order. The only mutation of
//! existing records is history compaction, which atomically replaces every
//! record of a path with one squashed update.
//!
//! A store found at a different schema version is never migrated in place:
//! it is moved aside as `name(1).ext`, `name(2).ext`, ... and a fresh store
//! is created at the configured path.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::config::StoreConfig;

const CF_UPDATES: &str = "updates";
const CF_META: &str = "meta";
const COLUMN_FAMILIES: &[&str] = &[CF_UPDATES, CF_META];

const KEY_VERSION: &[u8] = b"version";
const KEY_SEQUENCE: &[u8] = b"sequence";

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rocksdb::Error),
    #[error("column family '{0}' not found")]
    MissingColumnFamily(&'static str),
    /// No records exist for the path.
    #[error("no updates stored for '{0}'")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("failed to squash history for '{path}': {reason}")]
    Squash { path: String, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One persisted update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRecord {
    pub update: Vec<u8>,
    pub metadata: Vec<u8>,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    update: Vec<u8>,
    metadata: Vec<u8>,
    timestamp: f64,
}

impl StoredRecord {
    fn encode(update: &[u8], metadata: &[u8], timestamp: f64) -> Result<Vec<u8>, StoreError> {
        let stored = StoredRecord {
            update: lz4_flex::compress_prepend_size(update),
            metadata: metadata.to_vec(),
            timestamp,
        };
        bincode::serde::encode_to_vec(&stored, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<UpdateRecord, StoreError> {
        let (stored, _): (StoredRecord, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let update = lz4_flex::decompress_size_prepended(&stored.update)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        Ok(UpdateRecord {
            update,
            metadata: stored.metadata,
            timestamp: stored.timestamp,
        })
    }
}

struct Inner {
    db: DB,
    sequence: u64,
    write_opts: WriteOptions,
}

impl Inner {
    fn cf(&self, name: &'static str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }

    /// Every `(key, record)` stored for `path`, in write order.
    fn records(&self, path: &str) -> Result<Vec<(Box<[u8]>, UpdateRecord)>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = key_prefix(path);
        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            records.push((key, StoredRecord::decode(&value)?));
        }
        Ok(records)
    }

    fn last_record(&self, path: &str) -> Result<Option<UpdateRecord>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = key_prefix(path);
        let upper = record_key(path, u64::MAX);
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&upper, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                if key.starts_with(&prefix) {
                    Ok(Some(StoredRecord::decode(&value)?))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    fn next_sequence(&mut self) -> u64 {
        let seq = self.sequence;
        self.sequence += 1;
        seq
    }

    fn stage_append(
        &mut self,
        batch: &mut WriteBatch,
        path: &str,
        update: &[u8],
        metadata: &[u8],
        timestamp: f64,
    ) -> Result<(), StoreError> {
        let seq = self.next_sequence();
        let value = StoredRecord::encode(update, metadata, timestamp)?;
        batch.put_cf(self.cf(CF_UPDATES)?, record_key(path, seq), value);
        batch.put_cf(self.cf(CF_META)?, KEY_SEQUENCE, self.sequence.to_be_bytes());
        Ok(())
    }

    /// Replace every record of `path` with one holding the merged state.
    fn stage_squash(
        &mut self,
        batch: &mut WriteBatch,
        path: &str,
        timestamp: f64,
    ) -> Result<usize, StoreError> {
        let records = self.records(path)?;
        let squash_err = |reason: String| StoreError::Squash {
            path: path.to_string(),
            reason,
        };

        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            for (_, record) in &records {
                let update =
                    Update::decode_v1(&record.update).map_err(|e| squash_err(e.to_string()))?;
                txn.apply_update(update)
                    .map_err(|e| squash_err(e.to_string()))?;
            }
        }
        let squashed = doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default());

        let cf = self.cf(CF_UPDATES)?;
        for (key, _) in &records {
            batch.delete_cf(cf, key);
        }
        self.stage_append(batch, path, &squashed, &[], timestamp)?;
        Ok(records.len())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.db.write_opt(batch, &self.write_opts)?;
        Ok(())
    }
}

/// Append-only update log. Every operation is serialized through one mutex.
pub struct UpdateStore {
    inner: Mutex<Inner>,
    config: StoreConfig,
}

impl UpdateStore {
    /// Open the store, creating it when missing and moving an incompatible
    /// one aside. A store without a version marker counts as version 0.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut db = None;
        if config.path.exists() {
            let existing = open_db(&config.path)?;
            let found = read_version(&existing)?;
            if found == config.version {
                db = Some(existing);
            } else {
                drop(existing);
                let aside = move_aside(&config.path)?;
                log::warn!(
                    "Update store {} is at version {found}, expected {}; moved to {}",
                    config.path.display(),
                    config.version,
                    aside.display()
                );
            }
        }

        let db = match db {
            Some(db) => db,
            None => {
                let db = open_db(&config.path)?;
                let meta = db
                    .cf_handle(CF_META)
                    .ok_or(StoreError::MissingColumnFamily(CF_META))?;
                db.put_cf(meta, KEY_VERSION, config.version.to_be_bytes())?;
                log::info!(
                    "Created update store {} (version {})",
                    config.path.display(),
                    config.version
                );
                db
            }
        };

        let sequence = read_sequence(&db)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(config.sync_writes);
        Ok(Self {
            inner: Mutex::new(Inner {
                db,
                sequence,
                write_opts,
            }),
            config,
        })
    }

    /// Append an update for `path`.
    ///
    /// With a history TTL configured and the newest prior record older than
    /// it, all prior records are squashed into one in the same atomic batch.
    pub async fn write(&self, path: &str, update: &[u8], metadata: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let mut timestamp = now_secs();
        let mut batch = WriteBatch::default();

        if let Some(last) = inner.last_record(path)? {
            let age = timestamp - last.timestamp;
            // Keep timestamps non-decreasing even if the clock steps back.
            timestamp = timestamp.max(last.timestamp);
            if let Some(ttl) = self.config.history_ttl {
                if age > ttl.as_secs_f64() {
                    let squashed = inner.stage_squash(&mut batch, path, last.timestamp)?;
                    log::debug!("Squashed {squashed} records of {path}");
                }
            }
        }

        inner.stage_append(&mut batch, path, update, metadata, timestamp)?;
        inner.commit(batch)
    }

    /// Every record for `path` in write order; `NotFound` when there are none.
    pub async fn read(&self, path: &str) -> Result<Vec<UpdateRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let records: Vec<UpdateRecord> = inner
            .records(path)?
            .into_iter()
            .map(|(_, record)| record)
            .collect();
        if records.is_empty() {
            return Err(StoreError::NotFound(path.to_string()));
        }
        Ok(records)
    }

    pub async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.last_record(path)?.is_some())
    }

    /// Drop every record of `path`. Returns how many were removed.
    pub async fn delete(&self, path: &str) -> Result<usize, StoreError> {
        let inner = self.inner.lock().await;
        let records = inner.records(path)?;
        if records.is_empty() {
            return Ok(0);
        }
        let cf = inner.cf(CF_UPDATES)?;
        let mut batch = WriteBatch::default();
        for (key, _) in &records {
            batch.delete_cf(cf, key);
        }
        inner.commit(batch)?;
        Ok(records.len())
    }

    /// Distinct paths with at least one record.
    pub async fn list_paths(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        let cf = inner.cf(CF_UPDATES)?;
        let mut paths: Vec<String> = Vec::new();
        for item in inner.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            // path, NUL, 8-byte sequence
            if key.len() < 9 {
                continue;
            }
            let path = String::from_utf8_lossy(&key[..key.len() - 9]).into_owned();
            if paths.last() != Some(&path) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    pub fn version(&self) -> u32 {
        self.config.version
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

fn open_db(path: &Path) -> Result<DB, StoreError> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    opts.set_keep_log_file_num(5);
    Ok(DB::open_cf(&opts, path, COLUMN_FAMILIES)?)
}

fn read_u64(db: &DB, key: &[u8]) -> Result<Option<u64>, StoreError> {
    let meta = db
        .cf_handle(CF_META)
        .ok_or(StoreError::MissingColumnFamily(CF_META))?;
    match db.get_cf(meta, key)? {
        Some(bytes) if bytes.len() == 8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes);
            Ok(Some(u64::from_be_bytes(buf)))
        }
        Some(bytes) if bytes.len() == 4 => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes);
            Ok(Some(u32::from_be_bytes(buf) as u64))
        }
        Some(_) => Err(StoreError::Serialization(format!(
            "malformed meta value for '{}'",
            String::from_utf8_lossy(key)
        ))),
        None => Ok(None),
    }
}

fn read_version(db: &DB) -> Result<u32, StoreError> {
    let version = read_u64(db, KEY_VERSION)?.unwrap_or(0);
    u32::try_from(version).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn read_sequence(db: &DB) -> Result<u64, StoreError> {
    Ok(read_u64(db, KEY_SEQUENCE)?.unwrap_or(0))
}

/// Rename `path` to the first free `stem(N).ext` next to it.
fn move_aside(path: &Path) -> Result<PathBuf, StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut n = 1u32;
    loop {
        let candidate = parent.join(format!("{stem}({n}){ext}"));
        if !candidate.exists() {
            std::fs::rename(path, &candidate)?;
            return Ok(candidate);
        }
        n += 1;
    }
}

fn key_prefix(path: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(path.len() + 1);
    key.extend_from_slice(path.as_bytes());
    key.push(0);
    key
}

fn record_key(path: &str, seq: u64) -> Vec<u8> {
    let mut key = key_prefix(path);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

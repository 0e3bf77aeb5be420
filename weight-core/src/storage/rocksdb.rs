//! RocksDB-backed gateway store.
//!
//! Records are JSON-encoded and kept in dedicated column families:
//!
//! - `"log"`:         append index (u64 big-endian) -> log entry,
//! - `"log_index"`:   event hash -> append index,
//! - `"nonces"`:      request nonce -> empty,
//! - `"bundles"`:     `netuid/epoch/hotkey` (zero-padded) -> bundle,
//! - `"commitments"`: `epoch/hotkey` -> commit batch,
//! - `"reveals"`:     `epoch/hotkey` -> reveal batch,
//! - `"meta"`:        counters (`log_len`, `bundle_seq`).
//!
//! Writers serialize on a mutex so check-then-insert is atomic; each insert
//! is a single `WriteBatch`.

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{
    BundleStore, CommitmentStore, EventPage, EventQuery, LogStore, StorageError, batch_key,
    bundle_key, page_events,
};
use crate::canonical::{LogEntry, ValidationCommitment, ValidationReveal};
use crate::types::PublishedBundle;

const CF_LOG: &str = "log";
const CF_LOG_INDEX: &str = "log_index";
const CF_NONCES: &str = "nonces";
const CF_BUNDLES: &str = "bundles";
const CF_COMMITMENTS: &str = "commitments";
const CF_REVEALS: &str = "reveals";
const CF_META: &str = "meta";

const KEY_LOG_LEN: &[u8] = b"log_len";
const KEY_BUNDLE_SEQ: &[u8] = b"bundle_seq";

/// Configuration for [`RocksDbStore`].
#[derive(Clone, Debug)]
pub struct RocksDbConfig {
    /// Filesystem path to the RocksDB database directory.
    pub path: String,
    /// Whether to create the database and missing column families if they
    /// do not yet exist.
    pub create_if_missing: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            path: "data/gateway-db".to_string(),
            create_if_missing: true,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredBundle {
    seq: u64,
    bundle: PublishedBundle,
}

/// RocksDB-backed implementation of every gateway store trait.
pub struct RocksDbStore {
    db: DB,
    write_lock: Mutex<()>,
}

impl RocksDbStore {
    /// Opens (or creates) the store at the configured path.
    pub fn open(cfg: &RocksDbConfig) -> Result<Self, StorageError> {
        let path = Path::new(&cfg.path);

        let mut opts = Options::default();
        opts.create_if_missing(cfg.create_if_missing);
        opts.create_missing_column_families(cfg.create_if_missing);

        let cfs = [
            "default",
            CF_LOG,
            CF_LOG_INDEX,
            CF_NONCES,
            CF_BUNDLES,
            CF_COMMITMENTS,
            CF_REVEALS,
            CF_META,
        ]
        .into_iter()
        .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        tracing::info!(path = %cfg.path, "opened gateway store");

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &'static str) -> Result<Arc<BoundColumnFamily<'_>>, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or(StorageError::MissingColumnFamily(name))
    }

    fn writer(&self) -> Result<MutexGuard<'_, ()>, StorageError> {
        self.write_lock.lock().map_err(|_| StorageError::Poisoned)
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        cf: &'static str,
        key: &[u8],
    ) -> Result<Option<T>, StorageError> {
        let cf = self.cf(cf)?;
        match self.db.get_cf(&cf, key)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    fn exists(&self, cf: &'static str, key: &[u8]) -> Result<bool, StorageError> {
        let cf = self.cf(cf)?;
        Ok(self.db.get_cf(&cf, key)?.is_some())
    }

    fn counter(&self, key: &[u8]) -> Result<u64, StorageError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, key)? {
            None => Ok(0),
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::Corrupted("counter length"))?;
                Ok(u64::from_be_bytes(arr))
            }
        }
    }

    /// Values whose key starts with `prefix`, in key order.
    fn scan_prefix<T: DeserializeOwned>(
        &self,
        cf: &'static str,
        prefix: &[u8],
    ) -> Result<Vec<T>, StorageError> {
        let cf = self.cf(cf)?;
        let mut out = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    fn insert_batch<T: Serialize>(
        &self,
        cf: &'static str,
        key: &str,
        records: &[T],
        what: &'static str,
    ) -> Result<(), StorageError> {
        let _guard = self.writer()?;
        if self.exists(cf, key.as_bytes())? {
            return Err(StorageError::Duplicate(what));
        }
        let handle = self.cf(cf)?;
        self.db
            .put_cf(&handle, key.as_bytes(), serde_json::to_vec(records)?)?;
        Ok(())
    }
}

impl LogStore for RocksDbStore {
    fn append_event(&self, entry: &LogEntry, nonce: Option<&str>) -> Result<(), StorageError> {
        let _guard = self.writer()?;
        if self.exists(CF_LOG_INDEX, entry.event_hash.as_bytes())? {
            return Err(StorageError::Duplicate("event_hash"));
        }
        if let Some(nonce) = nonce {
            if self.exists(CF_NONCES, nonce.as_bytes())? {
                return Err(StorageError::Duplicate("nonce"));
            }
        }

        let index = self.counter(KEY_LOG_LEN)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(CF_LOG)?, index.to_be_bytes(), serde_json::to_vec(entry)?);
        batch.put_cf(
            &self.cf(CF_LOG_INDEX)?,
            entry.event_hash.as_bytes(),
            index.to_be_bytes(),
        );
        if let Some(nonce) = nonce {
            batch.put_cf(&self.cf(CF_NONCES)?, nonce.as_bytes(), b"");
        }
        batch.put_cf(&self.cf(CF_META)?, KEY_LOG_LEN, (index + 1).to_be_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    fn event(&self, event_hash: &str) -> Result<Option<LogEntry>, StorageError> {
        let cf = self.cf(CF_LOG_INDEX)?;
        let Some(index) = self.db.get_cf(&cf, event_hash.as_bytes())? else {
            return Ok(None);
        };
        self.get_json(CF_LOG, &index)
    }

    fn tip(&self) -> Result<Option<LogEntry>, StorageError> {
        match self.counter(KEY_LOG_LEN)? {
            0 => Ok(None),
            len => self.get_json(CF_LOG, &(len - 1).to_be_bytes()),
        }
    }

    fn events(&self, query: &EventQuery) -> Result<EventPage, StorageError> {
        let cf = self.cf(CF_LOG)?;
        let mut decoded = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            decoded.push(serde_json::from_slice::<LogEntry>(&value)?);
        }
        Ok(page_events(decoded.into_iter(), query))
    }

    fn nonce_seen(&self, nonce: &str) -> Result<bool, StorageError> {
        self.exists(CF_NONCES, nonce.as_bytes())
    }
}

impl BundleStore for RocksDbStore {
    fn insert_bundle(&self, bundle: &PublishedBundle) -> Result<(), StorageError> {
        let _guard = self.writer()?;
        let key = bundle_key(bundle.netuid, bundle.epoch_id, &bundle.validator_hotkey);
        if self.exists(CF_BUNDLES, key.as_bytes())? {
            return Err(StorageError::Duplicate("bundle"));
        }

        let seq = self.counter(KEY_BUNDLE_SEQ)? + 1;
        let stored = StoredBundle {
            seq,
            bundle: bundle.clone(),
        };
        let mut batch = WriteBatch::default();
        batch.put_cf(
            &self.cf(CF_BUNDLES)?,
            key.as_bytes(),
            serde_json::to_vec(&stored)?,
        );
        batch.put_cf(&self.cf(CF_META)?, KEY_BUNDLE_SEQ, seq.to_be_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    fn bundle(
        &self,
        netuid: u64,
        epoch_id: u64,
        validator_hotkey: &str,
    ) -> Result<Option<PublishedBundle>, StorageError> {
        let key = bundle_key(netuid, epoch_id, validator_hotkey);
        let stored: Option<StoredBundle> = self.get_json(CF_BUNDLES, key.as_bytes())?;
        Ok(stored.map(|s| s.bundle))
    }

    fn latest_bundle(
        &self,
        netuid: u64,
        epoch_id: u64,
    ) -> Result<Option<PublishedBundle>, StorageError> {
        let prefix = bundle_key(netuid, epoch_id, "");
        let stored: Vec<StoredBundle> = self.scan_prefix(CF_BUNDLES, prefix.as_bytes())?;
        Ok(stored.into_iter().max_by_key(|s| s.seq).map(|s| s.bundle))
    }

    fn current_bundle(&self, netuid: u64) -> Result<Option<PublishedBundle>, StorageError> {
        let prefix = format!("{netuid:020}/");
        let stored: Vec<StoredBundle> = self.scan_prefix(CF_BUNDLES, prefix.as_bytes())?;
        Ok(stored
            .into_iter()
            .max_by_key(|s| (s.bundle.epoch_id, s.seq))
            .map(|s| s.bundle))
    }
}

impl CommitmentStore for RocksDbStore {
    fn insert_commitments(
        &self,
        epoch_id: u64,
        validator_hotkey: &str,
        commitments: &[ValidationCommitment],
    ) -> Result<(), StorageError> {
        let key = batch_key(epoch_id, validator_hotkey);
        self.insert_batch(CF_COMMITMENTS, &key, commitments, "commit_batch")
    }

    fn commitments(
        &self,
        epoch_id: u64,
        validator_hotkey: &str,
    ) -> Result<Option<Vec<ValidationCommitment>>, StorageError> {
        let key = batch_key(epoch_id, validator_hotkey);
        self.get_json(CF_COMMITMENTS, key.as_bytes())
    }

    fn insert_reveals(
        &self,
        epoch_id: u64,
        validator_hotkey: &str,
        reveals: &[ValidationReveal],
    ) -> Result<(), StorageError> {
        let key = batch_key(epoch_id, validator_hotkey);
        self.insert_batch(CF_REVEALS, &key, reveals, "reveal_batch")
    }

    fn reveals(
        &self,
        epoch_id: u64,
        validator_hotkey: &str,
    ) -> Result<Option<Vec<ValidationReveal>>, StorageError> {
        let key = batch_key(epoch_id, validator_hotkey);
        self.get_json(CF_REVEALS, key.as_bytes())
    }
}

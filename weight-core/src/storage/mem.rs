//! In-memory gateway store.
//!
//! This implementation is useful for unit tests and small devnets. All
//! record families live behind one mutex so uniqueness checks and inserts
//! are atomic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{
    BundleStore, CommitmentStore, EventPage, EventQuery, LogStore, StorageError, batch_key,
    bundle_key, page_events,
};
use crate::canonical::{LogEntry, ValidationCommitment, ValidationReveal};
use crate::types::PublishedBundle;

#[derive(Default)]
struct Inner {
    log: Vec<LogEntry>,
    by_hash: HashMap<String, usize>,
    nonces: HashSet<String>,
    /// Sorted by `netuid/epoch/hotkey`, value is `(insert order, bundle)`.
    bundles: BTreeMap<String, (u64, PublishedBundle)>,
    bundle_counter: u64,
    commitments: HashMap<String, Vec<ValidationCommitment>>,
    reveals: HashMap<String, Vec<ValidationReveal>>,
}

/// In-memory implementation of every gateway store trait.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of log entries.
    pub fn len(&self) -> usize {
        self.lock().map(|g| g.log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl LogStore for InMemoryStore {
    fn append_event(&self, entry: &LogEntry, nonce: Option<&str>) -> Result<(), StorageError> {
        let mut g = self.lock()?;
        if g.by_hash.contains_key(&entry.event_hash) {
            return Err(StorageError::Duplicate("event_hash"));
        }
        if let Some(nonce) = nonce {
            if !g.nonces.insert(nonce.to_string()) {
                return Err(StorageError::Duplicate("nonce"));
            }
        }
        let index = g.log.len();
        g.by_hash.insert(entry.event_hash.clone(), index);
        g.log.push(entry.clone());
        Ok(())
    }

    fn event(&self, event_hash: &str) -> Result<Option<LogEntry>, StorageError> {
        let g = self.lock()?;
        Ok(g.by_hash.get(event_hash).map(|i| g.log[*i].clone()))
    }

    fn tip(&self) -> Result<Option<LogEntry>, StorageError> {
        Ok(self.lock()?.log.last().cloned())
    }

    fn events(&self, query: &EventQuery) -> Result<EventPage, StorageError> {
        let g = self.lock()?;
        Ok(page_events(g.log.iter().cloned(), query))
    }

    fn nonce_seen(&self, nonce: &str) -> Result<bool, StorageError> {
        Ok(self.lock()?.nonces.contains(nonce))
    }
}

impl BundleStore for InMemoryStore {
    fn insert_bundle(&self, bundle: &PublishedBundle) -> Result<(), StorageError> {
        let mut g = self.lock()?;
        let key = bundle_key(bundle.netuid, bundle.epoch_id, &bundle.validator_hotkey);
        if g.bundles.contains_key(&key) {
            return Err(StorageError::Duplicate("bundle"));
        }
        g.bundle_counter += 1;
        let order = g.bundle_counter;
        g.bundles.insert(key, (order, bundle.clone()));
        Ok(())
    }

    fn bundle(
        &self,
        netuid: u64,
        epoch_id: u64,
        validator_hotkey: &str,
    ) -> Result<Option<PublishedBundle>, StorageError> {
        let key = bundle_key(netuid, epoch_id, validator_hotkey);
        Ok(self.lock()?.bundles.get(&key).map(|(_, b)| b.clone()))
    }

    fn latest_bundle(
        &self,
        netuid: u64,
        epoch_id: u64,
    ) -> Result<Option<PublishedBundle>, StorageError> {
        let g = self.lock()?;
        Ok(g.bundles
            .values()
            .filter(|(_, b)| b.netuid == netuid && b.epoch_id == epoch_id)
            .max_by_key(|(order, _)| *order)
            .map(|(_, b)| b.clone()))
    }

    fn current_bundle(&self, netuid: u64) -> Result<Option<PublishedBundle>, StorageError> {
        let g = self.lock()?;
        Ok(g.bundles
            .values()
            .filter(|(_, b)| b.netuid == netuid)
            .max_by_key(|(order, b)| (b.epoch_id, *order))
            .map(|(_, b)| b.clone()))
    }
}

impl CommitmentStore for InMemoryStore {
    fn insert_commitments(
        &self,
        epoch_id: u64,
        validator_hotkey: &str,
        commitments: &[ValidationCommitment],
    ) -> Result<(), StorageError> {
        let mut g = self.lock()?;
        let key = batch_key(epoch_id, validator_hotkey);
        if g.commitments.contains_key(&key) {
            return Err(StorageError::Duplicate("commit_batch"));
        }
        g.commitments.insert(key, commitments.to_vec());
        Ok(())
    }

    fn commitments(
        &self,
        epoch_id: u64,
        validator_hotkey: &str,
    ) -> Result<Option<Vec<ValidationCommitment>>, StorageError> {
        let key = batch_key(epoch_id, validator_hotkey);
        Ok(self.lock()?.commitments.get(&key).cloned())
    }

    fn insert_reveals(
        &self,
        epoch_id: u64,
        validator_hotkey: &str,
        reveals: &[ValidationReveal],
    ) -> Result<(), StorageError> {
        let mut g = self.lock()?;
        let key = batch_key(epoch_id, validator_hotkey);
        if g.reveals.contains_key(&key) {
            return Err(StorageError::Duplicate("reveal_batch"));
        }
        g.reveals.insert(key, reveals.to_vec());
        Ok(())
    }

    fn reveals(
        &self,
        epoch_id: u64,
        validator_hotkey: &str,
    ) -> Result<Option<Vec<ValidationReveal>>, StorageError> {
        let key = batch_key(epoch_id, validator_hotkey);
        Ok(self.lock()?.reveals.get(&key).cloned())
    }
}

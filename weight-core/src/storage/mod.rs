//! Storage backends for the gateway.
//!
//! Three append-only record families are kept:
//!
//! - the transparency log ([`LogStore`]): entries keyed by event hash, in
//!   append order, with optional request nonces that must be unique,
//! - published weight bundles ([`BundleStore`]), at most one per
//!   `(netuid, epoch_id, validator_hotkey)`,
//! - validation commit and reveal batches ([`CommitmentStore`]), at most one
//!   of each per `(epoch_id, validator_hotkey)`.
//!
//! Two implementations are provided:
//!
//! - an in-memory store ([`mem::InMemoryStore`]) for tests and devnets,
//! - a RocksDB-backed store ([`rocksdb::RocksDbStore`]) for deployments.

pub mod mem;
pub mod rocksdb;

use thiserror::Error;

use crate::canonical::{LogEntry, ValidationCommitment, ValidationReveal};
use crate::types::PublishedBundle;

pub use mem::InMemoryStore;
pub use rocksdb::{RocksDbConfig, RocksDbStore};

/// Maximum page size for event listings.
pub const MAX_EVENT_PAGE: usize = 1000;

/// Storage-level error type.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("rocksdb: {0}")]
    RocksDb(#[from] ::rocksdb::Error),
    #[error("missing column family {0}")]
    MissingColumnFamily(&'static str),
    #[error("corrupted record: {0}")]
    Corrupted(&'static str),
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    /// A uniqueness constraint was violated.
    #[error("duplicate {0}")]
    Duplicate(&'static str),
    #[error("store lock poisoned")]
    Poisoned,
}

impl StorageError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StorageError::Duplicate(_))
    }
}

/// Filter for paging through the transparency log.
#[derive(Clone, Debug, Default)]
pub struct EventQuery {
    /// Lowest `monotonic_seq` to return.
    pub start_seq: u64,
    pub limit: usize,
    /// Restrict to one boot session.
    pub boot_id: Option<String>,
}

impl EventQuery {
    fn matches(&self, entry: &LogEntry) -> bool {
        entry.signed_event.monotonic_seq >= self.start_seq
            && self
                .boot_id
                .as_deref()
                .is_none_or(|b| b == entry.signed_event.boot_id)
    }

    fn page_size(&self) -> usize {
        self.limit.clamp(1, MAX_EVENT_PAGE)
    }
}

/// A page of log entries in append order.
#[derive(Clone, Debug, Default)]
pub struct EventPage {
    pub events: Vec<LogEntry>,
    pub has_more: bool,
}

/// Pages `iter` (append order) through `query`.
fn page_events(iter: impl Iterator<Item = LogEntry>, query: &EventQuery) -> EventPage {
    let size = query.page_size();
    let mut events: Vec<LogEntry> = iter.filter(|e| query.matches(e)).take(size + 1).collect();
    let has_more = events.len() > size;
    events.truncate(size);
    EventPage { events, has_more }
}

/// Append-only transparency log.
pub trait LogStore: Send + Sync {
    /// Appends `entry`. Fails with [`StorageError::Duplicate`] if the event
    /// hash or the `nonce` was seen before.
    fn append_event(&self, entry: &LogEntry, nonce: Option<&str>) -> Result<(), StorageError>;

    fn event(&self, event_hash: &str) -> Result<Option<LogEntry>, StorageError>;

    /// Most recently appended entry.
    fn tip(&self) -> Result<Option<LogEntry>, StorageError>;

    fn events(&self, query: &EventQuery) -> Result<EventPage, StorageError>;

    fn nonce_seen(&self, nonce: &str) -> Result<bool, StorageError>;
}

/// Published weight bundles.
pub trait BundleStore: Send + Sync {
    /// Inserts `bundle`; a second bundle for the same
    /// `(netuid, epoch_id, validator_hotkey)` fails with `Duplicate`.
    fn insert_bundle(&self, bundle: &PublishedBundle) -> Result<(), StorageError>;

    fn bundle(
        &self,
        netuid: u64,
        epoch_id: u64,
        validator_hotkey: &str,
    ) -> Result<Option<PublishedBundle>, StorageError>;

    /// Most recently accepted bundle for `(netuid, epoch_id)`.
    fn latest_bundle(
        &self,
        netuid: u64,
        epoch_id: u64,
    ) -> Result<Option<PublishedBundle>, StorageError>;

    /// Bundle with the highest epoch for `netuid`.
    fn current_bundle(&self, netuid: u64) -> Result<Option<PublishedBundle>, StorageError>;
}

/// Validation commit/reveal batches.
pub trait CommitmentStore: Send + Sync {
    fn insert_commitments(
        &self,
        epoch_id: u64,
        validator_hotkey: &str,
        commitments: &[ValidationCommitment],
    ) -> Result<(), StorageError>;

    fn commitments(
        &self,
        epoch_id: u64,
        validator_hotkey: &str,
    ) -> Result<Option<Vec<ValidationCommitment>>, StorageError>;

    fn insert_reveals(
        &self,
        epoch_id: u64,
        validator_hotkey: &str,
        reveals: &[ValidationReveal],
    ) -> Result<(), StorageError>;

    fn reveals(
        &self,
        epoch_id: u64,
        validator_hotkey: &str,
    ) -> Result<Option<Vec<ValidationReveal>>, StorageError>;
}

/// Everything the gateway persists.
pub trait GatewayStore: LogStore + BundleStore + CommitmentStore {}

impl<T: LogStore + BundleStore + CommitmentStore> GatewayStore for T {}

fn bundle_key(netuid: u64, epoch_id: u64, hotkey: &str) -> String {
    format!("{netuid:020}/{epoch_id:020}/{hotkey}")
}

fn batch_key(epoch_id: u64, hotkey: &str) -> String {
    format!("{epoch_id:020}/{hotkey}")
}

//! Gateway transparency log writer.
//!
//! A single [`EventLogger`] per gateway process assigns `monotonic_seq` and
//! `prev_event_hash` under a lock, signs each event hash with the gateway's
//! enclave key and appends the entry to the store. A new logger starts a
//! fresh boot session chained to the stored tip.

use std::sync::Arc;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::canonical::constants::event_types;
use crate::canonical::{
    EventError, LogEntry, SignedEvent, canonical_timestamp, compute_event_hash,
    verify_hash_chain_continuity, verify_log_entry, verify_monotonic_sequence,
};
use crate::signer::EnclaveKeypair;
use crate::storage::{LogStore, StorageError};

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Event(#[from] EventError),
}

impl LoggerError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, LoggerError::Storage(e) if e.is_duplicate())
    }
}

#[derive(Debug)]
struct ChainState {
    next_seq: u64,
    prev_hash: Option<String>,
}

pub struct EventLogger<S: LogStore + ?Sized> {
    store: Arc<S>,
    keypair: EnclaveKeypair,
    boot_id: String,
    state: Mutex<ChainState>,
}

impl<S: LogStore + ?Sized> EventLogger<S> {
    /// Starts a boot session whose first event links to the stored tip.
    pub fn new(store: Arc<S>, keypair: EnclaveKeypair) -> Result<Self, LoggerError> {
        let prev_hash = store.tip()?.map(|e| e.event_hash);
        let boot_id = Uuid::new_v4().to_string();
        tracing::info!(
            boot_id = %boot_id,
            previous_tip = ?prev_hash,
            "transparency log session started"
        );
        Ok(Self {
            store,
            keypair,
            boot_id,
            state: Mutex::new(ChainState {
                next_seq: 1,
                prev_hash,
            }),
        })
    }

    pub fn boot_id(&self) -> &str {
        &self.boot_id
    }

    pub fn enclave_pubkey(&self) -> String {
        self.keypair.public_key_hex()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Signs with the logger's enclave key (hex Ed25519).
    pub fn sign_hex(&self, message: &[u8]) -> String {
        self.keypair.sign_hex(message)
    }

    /// Signs, chains and persists one event.
    ///
    /// A `nonce` is stored with the entry and must be unique across the log.
    /// On any failure the sequence and chain head are left unchanged.
    pub async fn log_event(
        &self,
        event_type: &str,
        payload: Value,
        nonce: Option<&str>,
    ) -> Result<LogEntry, LoggerError> {
        let mut state = self.state.lock().await;

        let signed_event = SignedEvent {
            event_type: event_type.to_string(),
            timestamp: canonical_timestamp(),
            boot_id: self.boot_id.clone(),
            monotonic_seq: state.next_seq,
            prev_event_hash: state.prev_hash.clone(),
            payload,
        };
        let event_hash = compute_event_hash(&signed_event)?;
        let hash_bytes = hex::decode(&event_hash).map_err(|_| EventError::Malformed("event_hash"))?;

        let entry = LogEntry {
            signed_event,
            event_hash: event_hash.clone(),
            enclave_pubkey: self.keypair.public_key_hex(),
            enclave_signature: self.keypair.sign_hex(&hash_bytes),
        };
        self.store.append_event(&entry, nonce)?;

        state.next_seq += 1;
        state.prev_hash = Some(event_hash);
        tracing::debug!(
            event_type,
            seq = entry.signed_event.monotonic_seq,
            event_hash = %entry.event_hash,
            "logged transparency event"
        );
        Ok(entry)
    }

    /// Logs `ENCLAVE_RESTART` for this boot session. Must be the first event
    /// of the session so that it links directly to the stored tip.
    pub async fn publish_restart_event(&self) -> Result<LogEntry, LoggerError> {
        let previous_tip = self.state.lock().await.prev_hash.clone();
        let payload = json!({
            "new_boot_id": self.boot_id,
            "enclave_pubkey": self.keypair.public_key_hex(),
            "prev_log_tip_event_hash": previous_tip,
            "reason": "enclave_boot",
        });
        self.log_event(event_types::ENCLAVE_RESTART, payload, None)
            .await
    }
}

/// Verifies signatures, hash chain and sequence numbers of a log segment.
pub fn verify_log_segment(
    entries: &[LogEntry],
    expected_pubkey: Option<&str>,
) -> Result<(), EventError> {
    for entry in entries {
        verify_log_entry(entry, expected_pubkey)?;
    }
    verify_hash_chain_continuity(entries)?;
    verify_monotonic_sequence(entries)
}

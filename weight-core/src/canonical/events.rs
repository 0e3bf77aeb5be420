//! Transparency log entries and their verification.
//!
//! Each entry wraps a [`SignedEvent`]; `event_hash` is the SHA-256 of the
//! event's canonical JSON and the enclave signs the raw 32 hash bytes with
//! Ed25519. Events within a boot session chain through `prev_event_hash`
//! and carry a strictly increasing `monotonic_seq`.

use std::collections::HashMap;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::constants::{ED25519_PUBKEY_LEN, ED25519_SIGNATURE_LEN, SHA256_LEN, event_types};
use super::json::canonical_hash;

/// The part of a log entry covered by `event_hash`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedEvent {
    pub event_type: String,
    pub timestamp: String,
    pub boot_id: String,
    pub monotonic_seq: u64,
    pub prev_event_hash: Option<String>,
    pub payload: Value,
}

/// A signed, hash-chained transparency log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub signed_event: SignedEvent,
    pub event_hash: String,
    pub enclave_pubkey: String,
    pub enclave_signature: String,
}

impl LogEntry {
    pub fn event_type(&self) -> &str {
        &self.signed_event.event_type
    }

    pub fn is_restart(&self) -> bool {
        self.signed_event.event_type == event_types::ENCLAVE_RESTART
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event could not be encoded: {0}")]
    Encoding(String),
    #[error("pubkey mismatch: expected {expected}, got {actual}")]
    PubkeyMismatch { expected: String, actual: String },
    #[error("hash mismatch: computed {computed}, claimed {claimed}")]
    HashMismatch { computed: String, claimed: String },
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error("enclave signature does not verify")]
    BadSignature,
    #[error("hash chain broken at index {index}")]
    ChainBroken { index: usize },
    #[error("non-monotonic sequence in boot {boot_id} at index {index}")]
    NonMonotonic { boot_id: String, index: usize },
}

/// SHA-256 hex of the canonical JSON of `event`.
pub fn compute_event_hash(event: &SignedEvent) -> Result<String, EventError> {
    canonical_hash(event).map_err(|e| EventError::Encoding(e.to_string()))
}

fn decode_fixed<const N: usize>(hex_str: &str, what: &'static str) -> Result<[u8; N], EventError> {
    let raw = hex::decode(hex_str).map_err(|_| EventError::Malformed(what))?;
    raw.try_into().map_err(|_| EventError::Malformed(what))
}

/// Verifies an Ed25519 signature (hex) by `pubkey_hex` over `message`.
pub fn verify_ed25519_hex(
    pubkey_hex: &str,
    signature_hex: &str,
    message: &[u8],
) -> Result<(), EventError> {
    let pk: [u8; ED25519_PUBKEY_LEN] = decode_fixed(pubkey_hex, "enclave_pubkey")?;
    let sig: [u8; ED25519_SIGNATURE_LEN] = decode_fixed(signature_hex, "enclave_signature")?;
    let key = VerifyingKey::from_bytes(&pk).map_err(|_| EventError::Malformed("enclave_pubkey"))?;
    key.verify(message, &Signature::from_bytes(&sig))
        .map_err(|_| EventError::BadSignature)
}

/// Verifies a single entry: optional pubkey pin, hash recomputation, then
/// the signature over the raw hash bytes.
pub fn verify_log_entry(entry: &LogEntry, expected_pubkey: Option<&str>) -> Result<(), EventError> {
    if let Some(expected) = expected_pubkey {
        if !expected.eq_ignore_ascii_case(&entry.enclave_pubkey) {
            return Err(EventError::PubkeyMismatch {
                expected: expected.to_string(),
                actual: entry.enclave_pubkey.clone(),
            });
        }
    }

    let computed = compute_event_hash(&entry.signed_event)?;
    if computed != entry.event_hash {
        return Err(EventError::HashMismatch {
            computed,
            claimed: entry.event_hash.clone(),
        });
    }

    let hash_bytes: [u8; SHA256_LEN] = decode_fixed(&entry.event_hash, "event_hash")?;
    verify_ed25519_hex(&entry.enclave_pubkey, &entry.enclave_signature, &hash_bytes)
}

/// Checks that each entry's `prev_event_hash` names its predecessor.
///
/// `ENCLAVE_RESTART` entries may point anywhere (they link to the last tip
/// the new boot session could see). Returns the first breaking index.
pub fn verify_hash_chain_continuity(entries: &[LogEntry]) -> Result<(), EventError> {
    for (index, pair) in entries.windows(2).enumerate() {
        let (previous, current) = (&pair[0], &pair[1]);
        if current.is_restart() {
            continue;
        }
        if current.signed_event.prev_event_hash.as_deref() != Some(previous.event_hash.as_str()) {
            return Err(EventError::ChainBroken { index: index + 1 });
        }
    }
    Ok(())
}

/// Checks that `monotonic_seq` strictly increases within every boot session.
pub fn verify_monotonic_sequence(entries: &[LogEntry]) -> Result<(), EventError> {
    let mut last_seen: HashMap<&str, u64> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        let boot = entry.signed_event.boot_id.as_str();
        let seq = entry.signed_event.monotonic_seq;
        if let Some(prev) = last_seen.insert(boot, seq) {
            if seq <= prev {
                return Err(EventError::NonMonotonic {
                    boot_id: boot.to_string(),
                    index,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use serde_json::json;

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn entry(boot_id: &str, seq: u64, prev: Option<&LogEntry>, event_type: &str) -> LogEntry {
        let signed_event = SignedEvent {
            event_type: event_type.to_string(),
            timestamp: "2025-03-10T12:00:00.000000Z".to_string(),
            boot_id: boot_id.to_string(),
            monotonic_seq: seq,
            prev_event_hash: prev.map(|p| p.event_hash.clone()),
            payload: json!({"seq": seq}),
        };
        let event_hash = compute_event_hash(&signed_event).unwrap();
        let raw = hex::decode(&event_hash).unwrap();
        LogEntry {
            signed_event,
            event_hash,
            enclave_pubkey: hex::encode(key().verifying_key().to_bytes()),
            enclave_signature: hex::encode(key().sign(&raw).to_bytes()),
        }
    }

    fn segment() -> Vec<LogEntry> {
        let first = entry("boot-a", 1, None, event_types::ENCLAVE_RESTART);
        let second = entry("boot-a", 2, Some(&first), "LEAD_SUBMISSION");
        let restart = entry("boot-b", 1, Some(&first), event_types::ENCLAVE_RESTART);
        let after = entry("boot-b", 2, Some(&restart), "LEAD_SUBMISSION");
        vec![first, second, restart, after]
    }

    #[test]
    fn event_hash_ignores_key_order_in_payload() {
        let mut a = entry("boot-a", 1, None, "LEAD_SUBMISSION").signed_event;
        a.payload = json!({"x": 1, "y": [1, 2]});
        let mut b = a.clone();
        b.payload = serde_json::from_str(r#"{"y":[1,2],"x":1}"#).unwrap();
        assert_eq!(compute_event_hash(&a).unwrap(), compute_event_hash(&b).unwrap());

        b.monotonic_seq = 2;
        assert_ne!(compute_event_hash(&a).unwrap(), compute_event_hash(&b).unwrap());
    }

    #[test]
    fn entry_verification_checks_pin_hash_and_signature() {
        let good = entry("boot-a", 1, None, "LEAD_SUBMISSION");
        let pubkey = good.enclave_pubkey.to_uppercase();
        verify_log_entry(&good, Some(&pubkey)).unwrap();

        assert!(matches!(
            verify_log_entry(&good, Some(&"00".repeat(32))),
            Err(EventError::PubkeyMismatch { .. })
        ));

        let mut edited = good.clone();
        edited.signed_event.payload = json!({"seq": 99});
        assert!(matches!(
            verify_log_entry(&edited, None),
            Err(EventError::HashMismatch { .. })
        ));

        let mut resigned = good.clone();
        resigned.enclave_signature = hex::encode(key().sign(b"other").to_bytes());
        assert_eq!(verify_log_entry(&resigned, None), Err(EventError::BadSignature));

        let mut short = good;
        short.enclave_signature = "abcd".into();
        assert_eq!(
            verify_log_entry(&short, None),
            Err(EventError::Malformed("enclave_signature"))
        );
    }

    #[test]
    fn continuity_allows_restart_links_only() {
        let entries = segment();
        verify_hash_chain_continuity(&entries).unwrap();
        verify_monotonic_sequence(&entries).unwrap();

        let mut broken = entries.clone();
        broken[3] = entry("boot-b", 2, Some(&entries[1]), "LEAD_SUBMISSION");
        assert_eq!(
            verify_hash_chain_continuity(&broken),
            Err(EventError::ChainBroken { index: 3 })
        );

        let mut orphan = entries;
        orphan[1] = entry("boot-a", 2, None, "LEAD_SUBMISSION");
        assert_eq!(
            verify_hash_chain_continuity(&orphan),
            Err(EventError::ChainBroken { index: 1 })
        );
    }

    #[test]
    fn sequence_must_increase_within_a_boot() {
        let entries = segment();
        let repeated = entry("boot-b", 1, Some(&entries[2]), "LEAD_SUBMISSION");
        let mut bad = entries;
        bad[3] = repeated;
        assert_eq!(
            verify_monotonic_sequence(&bad),
            Err(EventError::NonMonotonic {
                boot_id: "boot-b".into(),
                index: 3,
            })
        );
        assert!(verify_monotonic_sequence(&[]).is_ok());
    }
}

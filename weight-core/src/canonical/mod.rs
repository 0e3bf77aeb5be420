//! Canonical codec shared by every role.
//!
//! Everything that feeds a hash or a signature lives here:
//!
//! - canonical JSON and SHA-256 helpers (`json`),
//! - weight conversion, invariants and bundle hashes (`weights`),
//! - hotkey → enclave binding messages (`binding`),
//! - transparency log entries and chain verification (`events`),
//! - commit/reveal hashing (`commitment`),
//! - signed relay request envelopes (`envelope`),
//! - canonical timestamps (`timestamps`),
//! - protocol constants (`constants`).

pub mod binding;
pub mod commitment;
pub mod constants;
pub mod envelope;
pub mod events;
pub mod json;
pub mod timestamps;
pub mod weights;

pub use binding::{
    BindingError, BindingExpectations, BindingFields, create_binding_message,
    parse_binding_message, sign_sr25519_hex, verify_binding_message, verify_sr25519_hex,
};
pub use commitment::{
    Decision, RevealError, ValidationCommitment, ValidationReveal, commit_hash,
    commit_validation, evidence_hash, generate_salt, verify_reveal,
};
pub use envelope::{EnvelopeError, SignedRequest};
pub use events::{
    EventError, LogEntry, SignedEvent, compute_event_hash, verify_ed25519_hex,
    verify_hash_chain_continuity, verify_log_entry, verify_monotonic_sequence,
};
pub use json::{canonical_hash, canonical_json, canonical_json_value, sha256_bytes, sha256_hex};
pub use timestamps::{
    TimestampError, canonical_timestamp, parse_canonical_timestamp, validate_timestamp_format,
};
pub use weights::{
    RawChainWeight, WeightPair, WeightsError, bundle_hash, compare_hash, filter_nonzero,
    fixed16_to_float, float_to_fixed16, normalize_chain_weights, tolerant_equal,
    validate_weights_invariants,
};

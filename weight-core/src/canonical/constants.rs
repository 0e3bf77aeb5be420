//! Protocol constants shared by the signer, gateway and auditors.
//!
//! Any change here changes hashes or timing windows on every component, so
//! these values are versioned together with the canonical encoding.

/// Blocks per epoch (tempo).
pub const EPOCH_LENGTH: u64 = 360;

/// Offset within an epoch from which weights may be submitted.
pub const WEIGHT_SUBMISSION_BLOCK: u64 = 345;

/// Last offset at which validation commits are accepted.
pub const SUBMIT_CUTOFF_BLOCK: u64 = 355;

/// Offset within epoch N+1 after which reveals for epoch N are refused.
pub const REVEAL_DEADLINE_BLOCK: u64 = 328;

/// Maximum distance between the gateway's block and a submission's block.
pub const MAX_BLOCK_DRIFT: u64 = 30;

/// Slack before [`WEIGHT_SUBMISSION_BLOCK`] tolerated for clock skew.
pub const EARLY_SUBMISSION_WINDOW: u64 = 15;

/// Average block time of the host chain.
pub const BLOCK_TIME_SECS: u64 = 12;

/// Version key passed with `set_weights`.
pub const VERSION_KEY: u64 = 0;

/// Subnet served by default.
pub const DEFAULT_NETUID: u16 = 71;

/// Per-uid tolerance when comparing fixed16 vectors after a float round-trip.
pub const AUDITOR_WEIGHT_TOLERANCE: u16 = 1;

/// Sentinel uid that receives 100% of an auditor's weight on burn.
pub const BURN_UID: u32 = 0;

/// Largest fixed16 weight.
pub const U16_MAX: u16 = u16::MAX;

pub const ED25519_SIGNATURE_LEN: usize = 64;
pub const ED25519_PUBKEY_LEN: usize = 32;
pub const SHA256_LEN: usize = 32;

/// Maximum age (either direction) of a signed relay request timestamp.
pub const MAX_REQUEST_SKEW_SECS: i64 = 480;

/// Transparency log event types.
pub mod event_types {
    pub const WEIGHT_SUBMISSION: &str = "WEIGHT_SUBMISSION";
    pub const WEIGHT_SUBMISSION_REJECTED_DUPLICATE: &str = "WEIGHT_SUBMISSION_REJECTED_DUPLICATE";
    pub const ENCLAVE_RESTART: &str = "ENCLAVE_RESTART";
    pub const EPOCH_AUDIT: &str = "EPOCH_AUDIT";
    pub const ARWEAVE_CHECKPOINT: &str = "ARWEAVE_CHECKPOINT";
    pub const GATEWAY_ATTESTATION: &str = "GATEWAY_ATTESTATION";
    pub const VALIDATION_COMMIT_BATCH: &str = "VALIDATION_COMMIT_BATCH";
    pub const VALIDATION_REVEAL_BATCH: &str = "VALIDATION_REVEAL_BATCH";
    pub const LEAD_SUBMISSION: &str = "LEAD_SUBMISSION";
}

/// Attestation `purpose` claims.
pub mod purposes {
    pub const VALIDATOR_WEIGHTS: &str = "validator_weights";
    pub const GATEWAY_EVENT_SIGNING: &str = "gateway_event_signing";
}

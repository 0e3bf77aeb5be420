//! Request and response bodies of the gateway HTTP API.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sp_core::crypto::Ss58Codec;
use sp_core::{Pair as _, sr25519};

use crate::canonical::{
    BindingError, LogEntry, SignedRequest, ValidationCommitment, ValidationReveal, canonical_json,
    sign_sr25519_hex, verify_sr25519_hex,
};

/// `GET /attestation/document`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayAttestation {
    pub enclave_pubkey: String,
    /// Base64 COSE_Sign1 attestation document.
    pub attestation_document: String,
    pub code_hash: String,
    pub purpose: String,
}

/// Successful `POST /weights/submit`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAccepted {
    pub status: String,
    pub weight_submission_event_hash: String,
    pub trust_level: String,
}

/// Rejection body shared by every ingress endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub stage: String,
    pub reason: String,
    #[serde(default)]
    pub detail: Option<String>,
}

/// `GET /weights/transparency/events`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventsPage {
    pub events: Vec<LogEntry>,
    pub has_more: bool,
}

/// Payload of a `POST /validate` commit batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitPayload {
    pub epoch_id: u64,
    pub validations: Vec<ValidationCommitment>,
}

pub type CommitRequest = SignedRequest<CommitPayload>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAccepted {
    pub status: String,
    pub epoch_id: u64,
    pub validation_count: usize,
    pub event_hash: String,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevealPayload {
    pub epoch_id: u64,
    pub reveals: Vec<ValidationReveal>,
}

/// `POST /reveal`: the hotkey signs the canonical JSON of `payload`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevealRequest {
    pub validator_hotkey: String,
    pub signature: String,
    pub payload: RevealPayload,
}

impl RevealRequest {
    pub fn sign(hotkey: &sr25519::Pair, payload: RevealPayload) -> Result<Self, serde_json::Error> {
        let message = canonical_json(&payload)?;
        Ok(Self {
            validator_hotkey: hotkey.public().to_ss58check(),
            signature: sign_sr25519_hex(hotkey, message.as_bytes()),
            payload,
        })
    }

    pub fn verify(&self) -> Result<(), BindingError> {
        let message =
            canonical_json(&self.payload).map_err(|_| BindingError::InvalidSignatureEncoding)?;
        verify_sr25519_hex(message.as_bytes(), &self.signature, &self.validator_hotkey)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealAccepted {
    pub status: String,
    pub epoch_id: u64,
    pub reveal_count: usize,
    pub event_hash: String,
}

/// Payload of a `POST /submit` lead. The lead body is opaque here; only
/// its hash is logged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeadPayload {
    pub lead_id: String,
    pub lead_blob_hash: String,
    pub lead: Value,
}

pub type LeadRequest = SignedRequest<LeadPayload>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStats {
    pub submissions: u32,
    pub max_submissions: u32,
    pub rejections: u32,
    pub max_rejections: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadAccepted {
    pub status: String,
    pub lead_id: String,
    pub event_hash: String,
    pub rate_limit_stats: RateLimitStats,
}

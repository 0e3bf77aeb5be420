//! Commit/reveal hashing for validation decisions.
//!
//! A validator commits `sha256(value ‖ salt_hex)` for its decision, its
//! reputation score and its rejection reason during epoch N, and reveals the
//! plaintext plus the salt during epoch N+1. The evidence blob is hashed
//! without a salt and is never revealed publicly.

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::json::{canonical_hash, canonical_json_value, sha256_hex};

/// Highest reputation score a validator may assign to a lead.
pub const MAX_REP_SCORE: u32 = 48;

/// Rejection reason carried by approved leads.
pub const PASS_REASON: &str = "pass";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Deny,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Deny => "deny",
        }
    }
}

/// Hashes committed for one lead. `evidence_blob` stays private.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationCommitment {
    pub lead_id: String,
    pub decision_hash: String,
    pub rep_score_hash: String,
    pub rejection_reason_hash: String,
    pub evidence_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_blob: Option<Value>,
}

/// Plaintext revealed for one lead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationReveal {
    pub lead_id: String,
    pub decision: Decision,
    pub rep_score: u32,
    pub rejection_reason: Value,
    pub salt: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RevealError {
    #[error("decision hash mismatch for lead {0}")]
    DecisionHashMismatch(String),
    #[error("rep score hash mismatch for lead {0}")]
    RepScoreHashMismatch(String),
    #[error("rejection reason hash mismatch for lead {0}")]
    RejectionReasonHashMismatch(String),
    #[error("rep score {score} outside [0, {MAX_REP_SCORE}] for lead {lead_id}")]
    RepScoreOutOfRange { lead_id: String, score: u32 },
    #[error("approved lead {0} must carry the pass rejection reason")]
    ApproveWithoutPass(String),
    #[error("salt for lead {0} is not hex")]
    BadSalt(String),
}

/// 32 random bytes, hex encoded. One per validator per epoch.
pub fn generate_salt() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `sha256(value ‖ salt_hex)` as lowercase hex.
pub fn commit_hash(value: &str, salt_hex: &str) -> String {
    let mut preimage = String::with_capacity(value.len() + salt_hex.len());
    preimage.push_str(value);
    preimage.push_str(salt_hex);
    sha256_hex(preimage.as_bytes())
}

/// String form of a rejection reason as it enters the commit hash.
///
/// Plain strings are used verbatim; structured reasons use canonical JSON.
pub fn rejection_reason_preimage(reason: &Value) -> String {
    match reason {
        Value::String(s) => s.clone(),
        other => canonical_json_value(other),
    }
}

/// Whether `reason` is the pass marker (`"pass"` or `{"message": "pass"}`).
pub fn is_pass_reason(reason: &Value) -> bool {
    match reason {
        Value::String(s) => s == PASS_REASON,
        Value::Object(map) => map.get("message").and_then(Value::as_str) == Some(PASS_REASON),
        _ => false,
    }
}

/// Unsalted SHA-256 of the evidence blob's canonical JSON.
pub fn evidence_hash(blob: &Value) -> String {
    canonical_hash(blob).unwrap_or_else(|_| sha256_hex(blob.to_string().as_bytes()))
}

/// Builds the commitment for a decision the validator will reveal later.
pub fn commit_validation(
    lead_id: &str,
    reveal: &ValidationReveal,
    evidence_blob: Value,
) -> ValidationCommitment {
    ValidationCommitment {
        lead_id: lead_id.to_string(),
        decision_hash: commit_hash(reveal.decision.as_str(), &reveal.salt),
        rep_score_hash: commit_hash(&reveal.rep_score.to_string(), &reveal.salt),
        rejection_reason_hash: commit_hash(
            &rejection_reason_preimage(&reveal.rejection_reason),
            &reveal.salt,
        ),
        evidence_hash: evidence_hash(&evidence_blob),
        evidence_blob: Some(evidence_blob),
    }
}

/// Recomputes all three salted hashes and checks reveal-side rules.
pub fn verify_reveal(
    commitment: &ValidationCommitment,
    reveal: &ValidationReveal,
) -> Result<(), RevealError> {
    let lead = || reveal.lead_id.clone();

    if hex::decode(&reveal.salt).is_err() {
        return Err(RevealError::BadSalt(lead()));
    }
    if reveal.rep_score > MAX_REP_SCORE {
        return Err(RevealError::RepScoreOutOfRange {
            lead_id: lead(),
            score: reveal.rep_score,
        });
    }
    if commit_hash(reveal.decision.as_str(), &reveal.salt) != commitment.decision_hash {
        return Err(RevealError::DecisionHashMismatch(lead()));
    }
    if commit_hash(&reveal.rep_score.to_string(), &reveal.salt) != commitment.rep_score_hash {
        return Err(RevealError::RepScoreHashMismatch(lead()));
    }
    let reason = rejection_reason_preimage(&reveal.rejection_reason);
    if commit_hash(&reason, &reveal.salt) != commitment.rejection_reason_hash {
        return Err(RevealError::RejectionReasonHashMismatch(lead()));
    }
    if reveal.decision == Decision::Approve && !is_pass_reason(&reveal.rejection_reason) {
        return Err(RevealError::ApproveWithoutPass(lead()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reveal(decision: Decision, score: u32, reason: Value, salt: &str) -> ValidationReveal {
        ValidationReveal {
            lead_id: "lead-1".to_string(),
            decision,
            rep_score: score,
            rejection_reason: reason,
            salt: salt.to_string(),
        }
    }

    #[test]
    fn commit_hash_is_value_then_salt() {
        assert_eq!(commit_hash("approve", "ab"), sha256_hex(b"approveab"));
    }

    #[test]
    fn salts_are_fresh() {
        let a = generate_salt();
        assert_eq!(a.len(), 64);
        assert_ne!(a, generate_salt());
    }

    #[test]
    fn honest_reveal_verifies() {
        let salt = generate_salt();
        let r = reveal(Decision::Approve, 30, json!({"message": "pass"}), &salt);
        let c = commit_validation("lead-1", &r, json!({"checks": ["dns", "email"]}));
        assert!(verify_reveal(&c, &r).is_ok());
        assert!(c.evidence_blob.is_some());
    }

    #[test]
    fn tampered_reveals_fail() {
        let salt = generate_salt();
        let honest = reveal(Decision::Deny, 0, json!("bad email"), &salt);
        let c = commit_validation("lead-1", &honest, json!({}));

        let flipped = reveal(Decision::Approve, 0, json!("bad email"), &salt);
        assert_eq!(
            verify_reveal(&c, &flipped),
            Err(RevealError::DecisionHashMismatch("lead-1".into()))
        );

        let rescored = reveal(Decision::Deny, 5, json!("bad email"), &salt);
        assert_eq!(
            verify_reveal(&c, &rescored),
            Err(RevealError::RepScoreHashMismatch("lead-1".into()))
        );

        let other_salt = reveal(Decision::Deny, 0, json!("bad email"), &generate_salt());
        assert!(verify_reveal(&c, &other_salt).is_err());
    }

    #[test]
    fn approve_requires_pass_and_score_is_bounded() {
        let salt = generate_salt();
        let r = reveal(Decision::Approve, 10, json!("bad email"), &salt);
        let c = commit_validation("lead-1", &r, json!({}));
        assert_eq!(
            verify_reveal(&c, &r),
            Err(RevealError::ApproveWithoutPass("lead-1".into()))
        );

        let r = reveal(Decision::Deny, 49, json!("x"), &salt);
        let c = commit_validation("lead-1", &r, json!({}));
        assert!(matches!(
            verify_reveal(&c, &r),
            Err(RevealError::RepScoreOutOfRange { score: 49, .. })
        ));
    }
}

//! Weight submissions as they travel from the enclave to the gateway and
//! from the gateway to auditors.

use serde::{Deserialize, Serialize};

use crate::canonical::WeightPair;
use crate::canonical::constants::U16_MAX;

/// Gateway ingress body for `POST /weights/submit`.
///
/// `weights_u16` is kept wide so out-of-range values from untrusted callers
/// are caught by the invariant check rather than by deserialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightSubmission {
    pub netuid: u64,
    pub epoch_id: u64,
    pub block: u64,
    pub uids: Vec<u32>,
    pub weights_u16: Vec<u64>,
    pub weights_hash: String,
    pub validator_hotkey: String,
    pub validator_enclave_pubkey: String,
    pub validator_signature: String,
    pub validator_attestation_b64: String,
    pub validator_code_hash: String,
    pub binding_message: String,
    pub validator_hotkey_signature: String,
}

impl WeightSubmission {
    /// Sparse pairs; call only after the invariant check has passed.
    pub fn pairs(&self) -> Vec<WeightPair> {
        self.uids
            .iter()
            .zip(&self.weights_u16)
            .map(|(uid, w)| (*uid, (*w).min(u64::from(U16_MAX)) as u16))
            .collect()
    }
}

/// A bundle the gateway accepted, as stored and served to auditors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublishedBundle {
    pub netuid: u64,
    pub epoch_id: u64,
    pub block: u64,
    pub uids: Vec<u32>,
    pub weights_u16: Vec<u16>,
    pub weights_hash: String,
    pub validator_hotkey: String,
    pub validator_enclave_pubkey: String,
    pub validator_signature: String,
    pub validator_attestation_b64: String,
    pub validator_code_hash: String,
    pub binding_message: String,
    pub validator_hotkey_signature: String,
    #[serde(default)]
    pub chain_snapshot_block: Option<u64>,
    #[serde(default)]
    pub chain_snapshot_compare_hash: Option<String>,
    pub weight_submission_event_hash: String,
    pub created_at: String,
}

impl PublishedBundle {
    pub fn from_submission(
        submission: &WeightSubmission,
        snapshot: Option<ChainSnapshot>,
        event_hash: String,
        created_at: String,
    ) -> Self {
        let pairs = submission.pairs();
        let (snapshot_block, snapshot_hash) = match snapshot {
            Some(s) => (Some(s.block), Some(s.compare_hash)),
            None => (None, None),
        };
        Self {
            netuid: submission.netuid,
            epoch_id: submission.epoch_id,
            block: submission.block,
            uids: pairs.iter().map(|(uid, _)| *uid).collect(),
            weights_u16: pairs.iter().map(|(_, w)| *w).collect(),
            weights_hash: submission.weights_hash.clone(),
            validator_hotkey: submission.validator_hotkey.clone(),
            validator_enclave_pubkey: submission.validator_enclave_pubkey.clone(),
            validator_signature: submission.validator_signature.clone(),
            validator_attestation_b64: submission.validator_attestation_b64.clone(),
            validator_code_hash: submission.validator_code_hash.clone(),
            binding_message: submission.binding_message.clone(),
            validator_hotkey_signature: submission.validator_hotkey_signature.clone(),
            chain_snapshot_block: snapshot_block,
            chain_snapshot_compare_hash: snapshot_hash,
            weight_submission_event_hash: event_hash,
            created_at,
        }
    }

    pub fn pairs(&self) -> Vec<WeightPair> {
        self.uids
            .iter()
            .copied()
            .zip(self.weights_u16.iter().copied())
            .collect()
    }

    /// Snapshot recorded at acceptance, if both halves are present.
    pub fn snapshot(&self) -> Option<ChainSnapshot> {
        match (self.chain_snapshot_block, &self.chain_snapshot_compare_hash) {
            (Some(block), Some(hash)) => Some(ChainSnapshot {
                block,
                compare_hash: hash.clone(),
            }),
            _ => None,
        }
    }
}

/// The primary's on-chain weights as observed when its bundle was accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub block: u64,
    pub compare_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> WeightSubmission {
        WeightSubmission {
            netuid: 71,
            epoch_id: 100,
            block: 36_346,
            uids: vec![3, 7],
            weights_u16: vec![65535, 100],
            weights_hash: "aa".into(),
            validator_hotkey: "hk".into(),
            validator_enclave_pubkey: "pk".into(),
            validator_signature: "sig".into(),
            validator_attestation_b64: "att".into(),
            validator_code_hash: "code".into(),
            binding_message: "bind".into(),
            validator_hotkey_signature: "hsig".into(),
        }
    }

    #[test]
    fn published_bundle_carries_snapshot() {
        let snap = ChainSnapshot {
            block: 36_350,
            compare_hash: "cmp".into(),
        };
        let b = PublishedBundle::from_submission(
            &submission(),
            Some(snap.clone()),
            "ev".into(),
            "2025-01-01T00:00:00Z".into(),
        );
        assert_eq!(b.pairs(), vec![(3, 65535), (7, 100)]);
        assert_eq!(b.snapshot(), Some(snap));

        let json = serde_json::to_string(&b).unwrap();
        let back: PublishedBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn missing_snapshot_fields_deserialize_as_none() {
        let b = PublishedBundle::from_submission(&submission(), None, "ev".into(), "t".into());
        let mut value = serde_json::to_value(&b).unwrap();
        let obj = value.as_object_mut().unwrap();
        obj.remove("chain_snapshot_block");
        obj.remove("chain_snapshot_compare_hash");
        let back: PublishedBundle = serde_json::from_value(value).unwrap();
        assert!(back.snapshot().is_none());
    }
}

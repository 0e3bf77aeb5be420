//! Per-epoch audit report over every validator on the subnet.
//!
//! The gateway builds one report per closed epoch and logs it as
//! `EPOCH_AUDIT`. The primary is judged against the chain snapshot captured
//! when its bundle was accepted; everyone else is judged against their live
//! chain weights.

use serde::{Deserialize, Serialize};

use crate::auditor::ComparisonMethod;
use crate::canonical::constants::AUDITOR_WEIGHT_TOLERANCE;
use crate::canonical::{compare_hash, normalize_chain_weights, tolerant_equal};
use crate::chain_client::ChainClient;
use crate::types::PublishedBundle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Verified,
    EquivocationDetected,
    AuditorMismatch,
    NoTeeBundle,
    NoPrimaryWeights,
}

impl AuditStatus {
    pub fn message(&self) -> &'static str {
        match self {
            AuditStatus::Verified => "all validators set weights matching the published bundle",
            AuditStatus::EquivocationDetected => {
                "primary set different weights on chain than it published"
            }
            AuditStatus::AuditorMismatch => "some auditors set different weights",
            AuditStatus::NoTeeBundle => "no bundle published for this epoch",
            AuditStatus::NoPrimaryWeights => "primary has not set weights on chain",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorAudit {
    pub uid: u32,
    pub hotkey: String,
    pub on_chain_hash: String,
    pub matches_tee: bool,
    pub is_primary: bool,
    pub comparison_method: ComparisonMethod,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub total_validators: usize,
    pub primary_count: usize,
    pub auditor_count: usize,
    pub matching_tee: usize,
    pub mismatched: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochAudit {
    pub epoch_id: u64,
    pub netuid: u64,
    pub status: AuditStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tee_weights_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tee_validator_hotkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tee_validator_pubkey: Option<String>,
    pub chain_snapshot_block: Option<u64>,
    pub chain_snapshot_hash: Option<String>,
    pub validators: Vec<ValidatorAudit>,
    pub summary: AuditSummary,
}

impl EpochAudit {
    fn without_bundle(netuid: u64, epoch_id: u64) -> Self {
        let status = AuditStatus::NoTeeBundle;
        Self {
            epoch_id,
            netuid,
            status,
            message: status.message().to_string(),
            tee_weights_hash: None,
            tee_validator_hotkey: None,
            tee_validator_pubkey: None,
            chain_snapshot_block: None,
            chain_snapshot_hash: None,
            validators: Vec::new(),
            summary: AuditSummary::default(),
        }
    }
}

/// Audits every uid in `hotkeys` (the metagraph, indexed by uid) against
/// `bundle`.
///
/// Uids whose weights cannot be read or that have set none are left out of
/// the report; they are not validators for this epoch's purposes.
pub async fn generate_epoch_audit<C: ChainClient + ?Sized>(
    netuid: u64,
    epoch_id: u64,
    bundle: Option<&PublishedBundle>,
    hotkeys: &[String],
    chain: &C,
) -> EpochAudit {
    let Some(bundle) = bundle else {
        tracing::info!(epoch_id, "no bundle to audit");
        return EpochAudit::without_bundle(netuid, epoch_id);
    };

    let tee_pairs = bundle.pairs();
    let tee_hash = compare_hash(netuid, epoch_id, &tee_pairs);
    let snapshot = bundle.snapshot();

    let mut validators = Vec::new();
    for (uid, hotkey) in hotkeys.iter().enumerate() {
        let Ok(uid) = u32::try_from(uid) else { break };
        let is_primary = hotkey == &bundle.validator_hotkey;

        if let (true, Some(snapshot)) = (is_primary, &snapshot) {
            let matches_tee = snapshot.compare_hash == tee_hash;
            validators.push(ValidatorAudit {
                uid,
                hotkey: hotkey.clone(),
                on_chain_hash: snapshot.compare_hash.clone(),
                matches_tee,
                is_primary,
                comparison_method: if matches_tee {
                    ComparisonMethod::Snapshot
                } else {
                    ComparisonMethod::Mismatch
                },
            });
            continue;
        }

        let raw = match chain.weights(netuid, uid).await {
            Ok(raw) if !raw.is_empty() => raw,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(uid, error = %e, "skipping uid: weights unavailable");
                continue;
            }
        };
        let chain_pairs = match normalize_chain_weights(&raw) {
            Ok(pairs) if !pairs.is_empty() => pairs,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(uid, error = %e, "skipping uid: malformed weights");
                continue;
            }
        };

        let chain_hash = compare_hash(netuid, epoch_id, &chain_pairs);
        let (matches_tee, comparison_method) = if chain_hash == tee_hash {
            (true, ComparisonMethod::Exact)
        } else if tolerant_equal(&tee_pairs, &chain_pairs, AUDITOR_WEIGHT_TOLERANCE) {
            (true, ComparisonMethod::Tolerance)
        } else {
            (false, ComparisonMethod::Mismatch)
        };
        validators.push(ValidatorAudit {
            uid,
            hotkey: hotkey.clone(),
            on_chain_hash: chain_hash,
            matches_tee,
            is_primary,
            comparison_method,
        });
    }

    let primary_count = validators.iter().filter(|v| v.is_primary).count();
    let primary_matches = validators
        .iter()
        .filter(|v| v.is_primary)
        .all(|v| v.matches_tee);
    let auditors_match = validators
        .iter()
        .filter(|v| !v.is_primary)
        .all(|v| v.matches_tee);

    let status = if primary_count == 0 {
        AuditStatus::NoPrimaryWeights
    } else if !primary_matches {
        AuditStatus::EquivocationDetected
    } else if !auditors_match {
        AuditStatus::AuditorMismatch
    } else {
        AuditStatus::Verified
    };

    let matching_tee = validators.iter().filter(|v| v.matches_tee).count();
    let summary = AuditSummary {
        total_validators: validators.len(),
        primary_count,
        auditor_count: validators.len() - primary_count,
        matching_tee,
        mismatched: validators.len() - matching_tee,
    };
    tracing::info!(epoch_id, status = ?status, validators = summary.total_validators, "epoch audit complete");

    EpochAudit {
        epoch_id,
        netuid,
        status,
        message: status.message().to_string(),
        tee_weights_hash: Some(tee_hash),
        tee_validator_hotkey: Some(bundle.validator_hotkey.clone()),
        tee_validator_pubkey: Some(bundle.validator_enclave_pubkey.clone()),
        chain_snapshot_block: snapshot.as_ref().map(|s| s.block),
        chain_snapshot_hash: snapshot.map(|s| s.compare_hash),
        validators,
        summary,
    }
}

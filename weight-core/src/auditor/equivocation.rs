//! Did the primary put the same weights on chain as in its bundle?
//!
//! The chain snapshot captured by the gateway at acceptance time is the
//! preferred evidence: live chain reads return whatever the primary set
//! most recently, which may already belong to a later epoch. The live read
//! is a weaker fallback and is logged as such.

use serde::{Deserialize, Serialize};

use crate::chain_client::{ChainClient, ChainError, uid_for_hotkey};
use crate::canonical::constants::AUDITOR_WEIGHT_TOLERANCE;
use crate::canonical::{compare_hash, normalize_chain_weights, tolerant_equal};
use crate::types::PublishedBundle;

/// How a bundle was matched against chain weights.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonMethod {
    /// Snapshot compare hash equal to the bundle's.
    Snapshot,
    /// Live chain weights hash-equal to the bundle.
    Exact,
    /// Live chain weights within ±1 per uid.
    Tolerance,
    /// Live read found no weights for the primary yet.
    NotSubmitted,
    Mismatch,
}

impl ComparisonMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonMethod::Snapshot => "snapshot",
            ComparisonMethod::Exact => "exact",
            ComparisonMethod::Tolerance => "tolerance",
            ComparisonMethod::NotSubmitted => "not_submitted",
            ComparisonMethod::Mismatch => "mismatch",
        }
    }

    pub fn is_match(&self) -> bool {
        !matches!(self, ComparisonMethod::Mismatch)
    }
}

/// Compares `bundle` with the primary's chain weights.
///
/// Chain errors are returned as-is so the caller can tell an outage from
/// equivocation.
pub async fn check_equivocation<C: ChainClient + ?Sized>(
    bundle: &PublishedBundle,
    chain: &C,
) -> Result<ComparisonMethod, ChainError> {
    let pairs = bundle.pairs();
    if pairs.is_empty() {
        return Ok(ComparisonMethod::Mismatch);
    }
    let bundle_compare = compare_hash(bundle.netuid, bundle.epoch_id, &pairs);

    if let Some(snapshot) = bundle.snapshot() {
        return Ok(if snapshot.compare_hash == bundle_compare {
            ComparisonMethod::Snapshot
        } else {
            tracing::error!(
                epoch_id = bundle.epoch_id,
                snapshot_block = snapshot.block,
                snapshot = %snapshot.compare_hash,
                bundle = %bundle_compare,
                "chain snapshot does not match bundle"
            );
            ComparisonMethod::Mismatch
        });
    }

    tracing::warn!(
        epoch_id = bundle.epoch_id,
        "bundle has no chain snapshot; falling back to a live chain read"
    );
    let Some(primary_uid) =
        uid_for_hotkey(chain, bundle.netuid, &bundle.validator_hotkey).await?
    else {
        tracing::error!(
            hotkey = %bundle.validator_hotkey,
            "primary hotkey not in metagraph"
        );
        return Ok(ComparisonMethod::Mismatch);
    };

    let raw = chain.weights(bundle.netuid, primary_uid).await?;
    if raw.is_empty() {
        return Ok(ComparisonMethod::NotSubmitted);
    }
    let chain_pairs = match normalize_chain_weights(&raw) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "primary's chain weights are malformed");
            return Ok(ComparisonMethod::Mismatch);
        }
    };

    if compare_hash(bundle.netuid, bundle.epoch_id, &chain_pairs) == bundle_compare {
        Ok(ComparisonMethod::Exact)
    } else if tolerant_equal(&pairs, &chain_pairs, AUDITOR_WEIGHT_TOLERANCE) {
        Ok(ComparisonMethod::Tolerance)
    } else {
        Ok(ComparisonMethod::Mismatch)
    }
}

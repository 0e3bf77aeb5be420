//! Weight vectors: fixed16 conversion, invariants and hashing.
//!
//! All components (enclave signer, gateway, auditors) go through these
//! functions. The float → fixed16 conversion is the host chain's own emit
//! conversion (max-upscale then round-half-even), so a bundle hash matches
//! what the chain stores for the same float vector.

use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use super::constants::{AUDITOR_WEIGHT_TOLERANCE, U16_MAX};
use super::json::{canonical_json_value, sha256_hex};

/// A sparse `(uid, fixed16 weight)` pair.
pub type WeightPair = (u32, u16);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WeightsError {
    #[error("array length mismatch: {uids} uids vs {weights} weights")]
    LengthMismatch { uids: usize, weights: usize },
    #[error("empty weight submission not allowed")]
    Empty,
    #[error("uids not strictly increasing: uids[{index_prev}]={prev}, uids[{index}]={uid}")]
    NotStrictlyIncreasing {
        index_prev: usize,
        prev: u32,
        index: usize,
        uid: u32,
    },
    #[error("weight out of range [1, 65535]: weights[{index}]={weight} (uid={uid})")]
    OutOfRange { index: usize, uid: u32, weight: u64 },
    #[error("negative weight at index {0}")]
    Negative(usize),
    #[error("non-finite weight at index {0}")]
    NonFinite(usize),
}

#[derive(Serialize)]
struct HashableWeights<'a> {
    netuid: u64,
    epoch_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    block: Option<u64>,
    weights: &'a [WeightPair],
}

fn sorted_pairs(pairs: &[WeightPair]) -> Vec<WeightPair> {
    let mut sorted = pairs.to_vec();
    sorted.sort_by_key(|(uid, _)| *uid);
    sorted
}

fn hash_weights(netuid: u64, epoch_id: u64, block: Option<u64>, pairs: &[WeightPair]) -> String {
    let sorted = sorted_pairs(pairs);
    let body = HashableWeights {
        netuid,
        epoch_id,
        block,
        weights: &sorted,
    };
    // Tuples serialize as two-element arrays; integers only, so this cannot fail.
    let value = serde_json::to_value(&body).unwrap_or_else(|_| json!(null));
    sha256_hex(canonical_json_value(&value).as_bytes())
}

/// Hash the enclave signs: `{block, epoch_id, netuid, weights}`.
///
/// Pairs are sorted by uid before hashing, so caller order is irrelevant.
pub fn bundle_hash(netuid: u64, epoch_id: u64, block: u64, pairs: &[WeightPair]) -> String {
    hash_weights(netuid, epoch_id, Some(block), pairs)
}

/// Block-independent hash used to compare a bundle with on-chain weights.
pub fn compare_hash(netuid: u64, epoch_id: u64, pairs: &[WeightPair]) -> String {
    hash_weights(netuid, epoch_id, None, pairs)
}

/// Converts float weights into fixed16 using the chain's emit conversion.
///
/// Weights are narrowed to `f32`, divided by the maximum weight and scaled
/// to `[0, 65535]` with round-half-even. Zero results are dropped, so the
/// output is already sparse. An all-zero vector yields an empty result.
pub fn float_to_fixed16(uids: &[u32], floats: &[f64]) -> Result<Vec<WeightPair>, WeightsError> {
    if uids.len() != floats.len() {
        return Err(WeightsError::LengthMismatch {
            uids: uids.len(),
            weights: floats.len(),
        });
    }

    let mut narrowed = Vec::with_capacity(floats.len());
    for (i, w) in floats.iter().enumerate() {
        if !w.is_finite() {
            return Err(WeightsError::NonFinite(i));
        }
        if *w < 0.0 {
            return Err(WeightsError::Negative(i));
        }
        narrowed.push(f64::from(*w as f32));
    }

    let sum: f64 = narrowed.iter().sum();
    if sum == 0.0 {
        return Ok(Vec::new());
    }
    let max = narrowed.iter().copied().fold(0.0_f64, f64::max);

    let mut out = Vec::with_capacity(uids.len());
    for (uid, w) in uids.iter().zip(narrowed) {
        let scaled = (w / max * f64::from(U16_MAX)).round_ties_even();
        let value = scaled.clamp(0.0, f64::from(U16_MAX)) as u16;
        if value != 0 {
            out.push((*uid, value));
        }
    }
    Ok(out)
}

/// Inverse of [`float_to_fixed16`]: normalizes fixed16 weights to sum to 1.
pub fn fixed16_to_float(pairs: &[WeightPair]) -> (Vec<u32>, Vec<f64>) {
    let uids = pairs.iter().map(|(uid, _)| *uid).collect();
    let total: u64 = pairs.iter().map(|(_, w)| u64::from(*w)).sum();
    let floats = if total == 0 {
        vec![0.0; pairs.len()]
    } else {
        pairs
            .iter()
            .map(|(_, w)| f64::from(*w) / total as f64)
            .collect()
    };
    (uids, floats)
}

/// Compares two sparse vectors over the union of their uids.
///
/// A uid missing on one side counts as weight 0: a weight of 1 may round to
/// 0 during a float round-trip and vanish from the sparse form.
pub fn tolerant_equal(expected: &[WeightPair], actual: &[WeightPair], tolerance: u16) -> bool {
    use std::collections::BTreeMap;

    let mut merged: BTreeMap<u32, (i32, i32)> = BTreeMap::new();
    for (uid, w) in expected {
        merged.entry(*uid).or_default().0 = i32::from(*w);
    }
    for (uid, w) in actual {
        merged.entry(*uid).or_default().1 = i32::from(*w);
    }
    merged
        .values()
        .all(|(e, a)| (e - a).abs() <= i32::from(tolerance))
}

/// [`tolerant_equal`] with the auditor default tolerance of ±1.
pub fn within_default_tolerance(expected: &[WeightPair], actual: &[WeightPair]) -> bool {
    tolerant_equal(expected, actual, AUDITOR_WEIGHT_TOLERANCE)
}

/// Checks the structural invariants of a submitted sparse vector.
///
/// `weights` is taken as `u64` so out-of-range values from untrusted JSON
/// are reported instead of silently truncated.
pub fn validate_weights_invariants(uids: &[u32], weights: &[u64]) -> Result<(), WeightsError> {
    if uids.len() != weights.len() {
        return Err(WeightsError::LengthMismatch {
            uids: uids.len(),
            weights: weights.len(),
        });
    }
    if uids.is_empty() {
        return Err(WeightsError::Empty);
    }
    for i in 1..uids.len() {
        if uids[i] <= uids[i - 1] {
            return Err(WeightsError::NotStrictlyIncreasing {
                index_prev: i - 1,
                prev: uids[i - 1],
                index: i,
                uid: uids[i],
            });
        }
    }
    for (i, w) in weights.iter().enumerate() {
        if *w < 1 || *w > u64::from(U16_MAX) {
            return Err(WeightsError::OutOfRange {
                index: i,
                uid: uids[i],
                weight: *w,
            });
        }
    }
    Ok(())
}

/// Removes zero weights and sorts by uid.
pub fn filter_nonzero(pairs: &[WeightPair]) -> Vec<WeightPair> {
    let mut out: Vec<WeightPair> = pairs.iter().copied().filter(|(_, w)| *w > 0).collect();
    out.sort_by_key(|(uid, _)| *uid);
    out
}

/// A weight value as read from the chain, which may be fixed16 or float.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RawChainWeight {
    Fixed(u64),
    Float(f64),
}

/// Normalizes raw chain weights into sparse sorted fixed16 pairs.
///
/// If any value is a float, the whole vector goes through
/// [`float_to_fixed16`]; otherwise integers are taken as-is (saturating at
/// 65535). Zeros are removed.
pub fn normalize_chain_weights(
    raw: &[(u32, RawChainWeight)],
) -> Result<Vec<WeightPair>, WeightsError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    let any_float = raw
        .iter()
        .any(|(_, w)| matches!(w, RawChainWeight::Float(_)));

    if any_float {
        let uids: Vec<u32> = raw.iter().map(|(uid, _)| *uid).collect();
        let floats: Vec<f64> = raw
            .iter()
            .map(|(_, w)| match w {
                RawChainWeight::Fixed(v) => *v as f64,
                RawChainWeight::Float(f) => *f,
            })
            .collect();
        let converted = float_to_fixed16(&uids, &floats)?;
        return Ok(filter_nonzero(&converted));
    }

    let pairs: Vec<WeightPair> = raw
        .iter()
        .map(|(uid, w)| {
            let v = match w {
                RawChainWeight::Fixed(v) => (*v).min(u64::from(U16_MAX)) as u16,
                RawChainWeight::Float(_) => 0,
            };
            (*uid, v)
        })
        .collect();
    Ok(filter_nonzero(&pairs))
}

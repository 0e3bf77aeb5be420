//! Weight submission pipeline.
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 0. weight invariants and allowed netuid,
//! 1. validator hotkey allowlist,
//! 2. at most one bundle per `(netuid, epoch_id, hotkey)`,
//! 3. freshness against the gateway's own block height,
//! 4. attestation (validator role, expected pubkey, purpose and epoch),
//! 5. hotkey binding to the enclave key and code hash,
//! 6. enclave signature over the claimed hash,
//! 7. hash recomputation.
//!
//! An accepted submission is snapshotted against the primary's chain
//! weights, logged as `WEIGHT_SUBMISSION` and stored.

use std::time::Instant;

use serde_json::json;

use weight_core::attestation::{AttestationRequest, TrustLevel};
use weight_core::canonical::constants::event_types;
use weight_core::canonical::{
    BindingExpectations, bundle_hash, compare_hash, normalize_chain_weights,
    validate_weights_invariants, verify_binding_message, verify_ed25519_hex,
};
use weight_core::chain_client::uid_for_hotkey;
use weight_core::storage::BundleStore;
use weight_core::{ChainSnapshot, PublishedBundle, SubmitAccepted, WeightSubmission};

use crate::error::{ApiError, stages};
use crate::state::AppState;

/// Runs checks 0 through 7. Returns the attestation trust level.
pub async fn verify_submission(
    state: &AppState,
    sub: &WeightSubmission,
) -> Result<TrustLevel, ApiError> {
    // 0. invariants
    validate_weights_invariants(&sub.uids, &sub.weights_u16)
        .map_err(|e| ApiError::bad_request(stages::INVALID_WEIGHTS, e.to_string()))?;
    if !state.config.allowed_netuids.contains(&sub.netuid) {
        return Err(ApiError::bad_request(
            stages::INVALID_WEIGHTS,
            format!("netuid {} is not served by this gateway", sub.netuid),
        ));
    }

    // 1. allowlist
    if !state.config.hotkey_allowed(&sub.validator_hotkey) {
        return Err(ApiError::forbidden(
            stages::UNAUTHORIZED_HOTKEY,
            "hotkey is not an authorized validator",
        ));
    }

    // 2. duplicate
    let existing = state
        .store()
        .bundle(sub.netuid, sub.epoch_id, &sub.validator_hotkey)
        .map_err(ApiError::internal)?;
    if let Some(existing) = existing {
        reject_duplicate(
            state,
            sub,
            Some(&existing.weight_submission_event_hash),
            None,
        )
        .await;
        return Err(ApiError::conflict(
            stages::DUPLICATE_SUBMISSION,
            format!("bundle for epoch {} already accepted", sub.epoch_id),
        )
        .with_detail(existing.weight_submission_event_hash));
    }

    // 3. freshness
    let gateway_block = state
        .clock
        .current_block()
        .await
        .map_err(ApiError::unavailable)?;
    state
        .config
        .schedule
        .check_freshness(gateway_block, sub.epoch_id, sub.block)
        .map_err(|e| ApiError::bad_request(stages::STALE_SUBMISSION, e.to_string()))?;

    // 4. attestation
    let request =
        AttestationRequest::validator_weights(&sub.validator_enclave_pubkey, sub.epoch_id);
    let verified = state
        .verifier
        .verify_b64(&sub.validator_attestation_b64, &request)
        .await
        .map_err(|e| {
            ApiError::forbidden(stages::ATTESTATION_FAILED, e.to_string()).with_detail(e.stage())
        })?;
    if verified
        .claims
        .code_hash
        .as_ref()
        .is_some_and(|c| c != &sub.validator_code_hash)
    {
        return Err(ApiError::forbidden(
            stages::ATTESTATION_FAILED,
            "attested code hash differs from submission",
        ));
    }

    // 5. binding
    verify_binding_message(
        &sub.binding_message,
        &sub.validator_hotkey_signature,
        &sub.validator_hotkey,
        &BindingExpectations {
            netuid: sub.netuid,
            chain: &state.config.expected_chain,
            enclave_pubkey: &sub.validator_enclave_pubkey,
            code_hash: &sub.validator_code_hash,
        },
    )
    .map_err(|e| ApiError::forbidden(stages::BINDING_INVALID, e.to_string()))?;

    // 6. signature over the claimed hash
    let claimed = hex::decode(&sub.weights_hash).map_err(|_| {
        ApiError::new(
            axum::http::StatusCode::UNAUTHORIZED,
            stages::SIGNATURE_INVALID,
            "weights_hash is not hex",
        )
    })?;
    verify_ed25519_hex(
        &sub.validator_enclave_pubkey,
        &sub.validator_signature,
        &claimed,
    )
    .map_err(|e| {
        ApiError::new(
            axum::http::StatusCode::UNAUTHORIZED,
            stages::SIGNATURE_INVALID,
            e.to_string(),
        )
    })?;

    // 7. hash recomputation
    let computed = bundle_hash(sub.netuid, sub.epoch_id, sub.block, &sub.pairs());
    if computed != sub.weights_hash {
        return Err(ApiError::bad_request(
            stages::HASH_MISMATCH,
            "weights_hash does not match the submitted weights",
        )
        .with_detail(format!("computed {computed}")));
    }

    Ok(verified.trust_level)
}

/// Logs a refused second bundle. `orphaned_event_hash` names a
/// `WEIGHT_SUBMISSION` entry that lost the race to the store.
async fn reject_duplicate(
    state: &AppState,
    sub: &WeightSubmission,
    existing_event_hash: Option<&str>,
    orphaned_event_hash: Option<&str>,
) {
    let payload = json!({
        "epoch_id": sub.epoch_id,
        "netuid": sub.netuid,
        "validator_hotkey": sub.validator_hotkey,
        "weights_hash": sub.weights_hash,
        "existing_event_hash": existing_event_hash,
        "orphaned_event_hash": orphaned_event_hash,
    });
    if let Err(e) = state
        .log_event(event_types::WEIGHT_SUBMISSION_REJECTED_DUPLICATE, payload, None)
        .await
    {
        tracing::warn!(error = %e, "failed to log duplicate submission");
    }
}

/// The primary's on-chain weights right now, if they can be read.
///
/// Any failure leaves the snapshot absent; auditors then fall back to live
/// chain reads.
pub async fn capture_snapshot(state: &AppState, sub: &WeightSubmission) -> Option<ChainSnapshot> {
    let chain = state.chain.as_ref();
    let snapshot = async {
        let uid = uid_for_hotkey(chain, sub.netuid, &sub.validator_hotkey)
            .await
            .ok()??;
        let raw = chain.weights(sub.netuid, uid).await.ok()?;
        let pairs = normalize_chain_weights(&raw).ok()?;
        if pairs.is_empty() {
            return None;
        }
        let block = chain.current_block().await.ok()?;
        Some(ChainSnapshot {
            block,
            compare_hash: compare_hash(sub.netuid, sub.epoch_id, &pairs),
        })
    }
    .await;
    if snapshot.is_none() {
        tracing::info!(
            epoch_id = sub.epoch_id,
            hotkey = %sub.validator_hotkey,
            "no chain snapshot for primary"
        );
    }
    snapshot
}

/// Verifies, snapshots, logs and stores one submission.
pub async fn accept_submission(
    state: &AppState,
    sub: &WeightSubmission,
) -> Result<SubmitAccepted, ApiError> {
    let metrics = &state.metrics.gateway;
    let started = Instant::now();
    let verdict = verify_submission(state, sub).await;
    metrics
        .verification_seconds
        .observe(started.elapsed().as_secs_f64());

    let trust_level = match verdict {
        Ok(level) => level,
        Err(e) => {
            metrics.submissions_total.with_label_values(&[e.stage]).inc();
            tracing::warn!(
                stage = e.stage,
                reason = %e.reason,
                epoch_id = sub.epoch_id,
                hotkey = %sub.validator_hotkey,
                "weight submission rejected"
            );
            return Err(e);
        }
    };

    persist_submission(state, sub, trust_level).await
}

/// Snapshots, logs and stores a verified submission.
///
/// A concurrent submission can win the store insert after this one passed
/// the duplicate check. The loser's `WEIGHT_SUBMISSION` entry is then
/// already in the log, so a `WEIGHT_SUBMISSION_REJECTED_DUPLICATE` naming it
/// follows.
pub async fn persist_submission(
    state: &AppState,
    sub: &WeightSubmission,
    trust_level: TrustLevel,
) -> Result<SubmitAccepted, ApiError> {
    let metrics = &state.metrics.gateway;
    let snapshot = capture_snapshot(state, sub).await;
    let payload = json!({
        "epoch_id": sub.epoch_id,
        "netuid": sub.netuid,
        "block": sub.block,
        "weights_hash": sub.weights_hash,
        "validator_hotkey": sub.validator_hotkey,
        "weights_count": sub.uids.len(),
        "chain_snapshot_block": snapshot.as_ref().map(|s| s.block),
        "chain_snapshot_compare_hash": snapshot.as_ref().map(|s| s.compare_hash.clone()),
    });
    let entry = state
        .log_event(event_types::WEIGHT_SUBMISSION, payload, None)
        .await
        .map_err(ApiError::internal)?;

    let bundle = PublishedBundle::from_submission(
        sub,
        snapshot,
        entry.event_hash.clone(),
        entry.signed_event.timestamp.clone(),
    );
    if let Err(e) = state.store().insert_bundle(&bundle) {
        if e.is_duplicate() {
            let winner = state
                .store()
                .bundle(sub.netuid, sub.epoch_id, &sub.validator_hotkey)
                .ok()
                .flatten()
                .map(|b| b.weight_submission_event_hash);
            reject_duplicate(state, sub, winner.as_deref(), Some(&entry.event_hash)).await;
            metrics
                .submissions_total
                .with_label_values(&[stages::DUPLICATE_SUBMISSION])
                .inc();
            return Err(ApiError::conflict(
                stages::DUPLICATE_SUBMISSION,
                "a concurrent submission was accepted first",
            ));
        }
        return Err(ApiError::internal(e));
    }

    metrics.submissions_total.with_label_values(&["accepted"]).inc();
    tracing::info!(
        epoch_id = sub.epoch_id,
        netuid = sub.netuid,
        hotkey = %sub.validator_hotkey,
        weights = sub.uids.len(),
        event_hash = %entry.event_hash,
        trust_level = trust_level.as_str(),
        "weight submission accepted"
    );
    Ok(SubmitAccepted {
        status: "accepted".to_string(),
        weight_submission_event_hash: entry.event_hash,
        trust_level: trust_level.as_str().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use weight_core::canonical::RawChainWeight;
    use weight_core::storage::{BundleStore, EventQuery, LogStore};

    use crate::state::test_support::{harness, signer};

    const EPOCH: u64 = 100;
    const BLOCK: u64 = EPOCH * 360 + 346;

    fn submission() -> WeightSubmission {
        signer()
            .sign_epoch(EPOCH, BLOCK, &[0, 2, 5], &[0.1, 0.6, 0.3])
            .unwrap()
    }

    #[tokio::test]
    async fn honest_submission_is_accepted_with_snapshot() {
        let h = harness().await;
        let sub = submission();
        h.chain.set_block(BLOCK + 2);
        h.chain
            .set_hotkeys(71, vec!["burn".into(), sub.validator_hotkey.clone()]);
        let row = sub
            .pairs()
            .into_iter()
            .map(|(uid, w)| (uid, RawChainWeight::Fixed(u64::from(w))))
            .collect();
        h.chain.set_raw_weights(71, 1, row);

        let accepted = accept_submission(&h.state, &sub).await.unwrap();
        assert_eq!(accepted.status, "accepted");
        assert_eq!(accepted.trust_level, "signature_only");

        let stored = h.store.bundle(71, EPOCH, &sub.validator_hotkey).unwrap().unwrap();
        assert_eq!(stored.weight_submission_event_hash, accepted.weight_submission_event_hash);
        let snapshot = stored.snapshot().unwrap();
        assert_eq!(snapshot.compare_hash, compare_hash(71, EPOCH, &sub.pairs()));

        let entry = h
            .store
            .event(&accepted.weight_submission_event_hash)
            .unwrap()
            .unwrap();
        assert_eq!(entry.signed_event.payload["weights_count"], 3);
        assert_eq!(entry.signed_event.payload["weights_hash"], sub.weights_hash);
    }

    #[tokio::test]
    async fn second_submission_is_a_logged_duplicate() {
        let h = harness().await;
        h.chain.set_block(BLOCK);
        let sub = submission();
        accept_submission(&h.state, &sub).await.unwrap();
        // Snapshot is absent: the primary is not in the metagraph.
        let stored = h.store.bundle(71, EPOCH, &sub.validator_hotkey).unwrap().unwrap();
        assert!(stored.snapshot().is_none());

        let err = accept_submission(&h.state, &submission()).await.unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.stage, stages::DUPLICATE_SUBMISSION);

        let tip = h.store.tip().unwrap().unwrap();
        assert_eq!(tip.event_type(), event_types::WEIGHT_SUBMISSION_REJECTED_DUPLICATE);
    }

    #[tokio::test]
    async fn store_race_loser_is_logged_as_duplicate() {
        let h = harness().await;
        h.chain.set_block(BLOCK);
        let sub = submission();
        let level = verify_submission(&h.state, &sub).await.unwrap();

        // Another request stores its bundle between the check and the insert.
        let winner = PublishedBundle::from_submission(
            &sub,
            None,
            "ab".repeat(32),
            "2025-01-01T00:00:00.000000Z".to_string(),
        );
        h.store.insert_bundle(&winner).unwrap();

        let err = persist_submission(&h.state, &sub, level).await.unwrap_err();
        assert_eq!((err.status, err.stage), (StatusCode::CONFLICT, stages::DUPLICATE_SUBMISSION));

        let tip = h.store.tip().unwrap().unwrap();
        assert_eq!(tip.event_type(), event_types::WEIGHT_SUBMISSION_REJECTED_DUPLICATE);
        assert_eq!(tip.signed_event.payload["existing_event_hash"], "ab".repeat(32));
        let orphaned = tip.signed_event.payload["orphaned_event_hash"]
            .as_str()
            .unwrap()
            .to_string();
        let orphan = h.store.event(&orphaned).unwrap().unwrap();
        assert_eq!(orphan.event_type(), event_types::WEIGHT_SUBMISSION);

        let stored = h.store.bundle(71, EPOCH, &sub.validator_hotkey).unwrap().unwrap();
        assert_eq!(stored.weight_submission_event_hash, "ab".repeat(32));
    }

    #[tokio::test]
    async fn rejections_follow_the_check_order() {
        let h = harness().await;
        h.chain.set_block(BLOCK);

        let mut unsorted = submission();
        unsorted.uids.swap(0, 1);
        let err = accept_submission(&h.state, &unsorted).await.unwrap_err();
        assert_eq!((err.status, err.stage), (StatusCode::BAD_REQUEST, stages::INVALID_WEIGHTS));

        let mut wrong_netuid = submission();
        wrong_netuid.netuid = 1;
        let err = accept_submission(&h.state, &wrong_netuid).await.unwrap_err();
        assert_eq!(err.stage, stages::INVALID_WEIGHTS);

        h.chain.set_block(BLOCK + 31);
        let err = accept_submission(&h.state, &submission()).await.unwrap_err();
        assert_eq!(err.stage, stages::STALE_SUBMISSION);
        h.chain.set_block(BLOCK);

        let mut other_key = submission();
        other_key.validator_enclave_pubkey = "11".repeat(32);
        let err = accept_submission(&h.state, &other_key).await.unwrap_err();
        assert_eq!((err.status, err.stage), (StatusCode::FORBIDDEN, stages::ATTESTATION_FAILED));

        let mut rebound = submission();
        rebound.binding_message = rebound.binding_message.replace("netuid=71", "netuid=72");
        let err = accept_submission(&h.state, &rebound).await.unwrap_err();
        assert_eq!(err.stage, stages::BINDING_INVALID);

        let mut forged = submission();
        forged.weights_hash = "00".repeat(32);
        let err = accept_submission(&h.state, &forged).await.unwrap_err();
        assert_eq!((err.status, err.stage), (StatusCode::UNAUTHORIZED, stages::SIGNATURE_INVALID));

        // Signature still covers the claimed hash, but the weights changed.
        let mut tampered = submission();
        tampered.weights_u16[1] -= 1;
        let err = accept_submission(&h.state, &tampered).await.unwrap_err();
        assert_eq!(err.stage, stages::HASH_MISMATCH);

        let page = h
            .store
            .events(&EventQuery {
                limit: 100,
                ..EventQuery::default()
            })
            .unwrap();
        assert!(page
            .events
            .iter()
            .all(|e| e.event_type() != event_types::WEIGHT_SUBMISSION));
    }

    #[tokio::test]
    async fn unlisted_hotkey_is_refused() {
        let h = crate::state::test_support::harness_with(crate::config::GatewayConfig {
            expected_chain: crate::state::test_support::CHAIN.to_string(),
            allowed_hotkeys: ["5SomebodyElse".to_string()].into(),
            ..crate::config::GatewayConfig::default()
        })
        .await;
        h.chain.set_block(BLOCK);
        let err = accept_submission(&h.state, &submission()).await.unwrap_err();
        assert_eq!((err.status, err.stage), (StatusCode::FORBIDDEN, stages::UNAUTHORIZED_HOTKEY));
    }
}

//! `POST /validate`: a validator's commit batch for the current epoch.
//!
//! Only hashes reach the transparency log. Evidence blobs are kept in the
//! gateway store and never published.

use axum::{Json, extract::State};
use chrono::Utc;
use serde_json::json;

use weight_core::canonical::constants::event_types;
use weight_core::canonical::evidence_hash;
use weight_core::storage::CommitmentStore;
use weight_core::{CommitAccepted, CommitRequest};

use crate::error::{ApiError, stages};
use crate::relay::{log_rejection, record, verify_envelope};
use crate::state::{AppState, SharedState};

pub async fn commit(
    State(state): State<SharedState>,
    Json(request): Json<CommitRequest>,
) -> Result<Json<CommitAccepted>, ApiError> {
    let outcome = handle_commit(&state, &request).await;
    record(&state, "validate", &outcome);
    outcome.map(Json)
}

async fn handle_commit(
    state: &AppState,
    request: &CommitRequest,
) -> Result<CommitAccepted, ApiError> {
    verify_envelope(state, request, event_types::VALIDATION_COMMIT_BATCH, Utc::now())?;

    let hotkey = &request.actor_hotkey;
    if !state.config.hotkey_allowed(hotkey) {
        return Err(ApiError::forbidden(
            stages::UNAUTHORIZED_HOTKEY,
            "hotkey is not an authorized validator",
        ));
    }

    let payload = &request.payload;
    if payload.validations.is_empty() {
        return Err(ApiError::bad_request(
            stages::INVALID_REQUEST,
            "commit batch is empty",
        ));
    }
    for c in &payload.validations {
        if let Some(blob) = &c.evidence_blob {
            if evidence_hash(blob) != c.evidence_hash {
                return Err(ApiError::bad_request(
                    stages::HASH_MISMATCH,
                    format!("evidence hash mismatch for lead {}", c.lead_id),
                ));
            }
        }
    }

    let schedule = &state.config.schedule;
    let block = state
        .clock
        .current_block()
        .await
        .map_err(ApiError::unavailable)?;
    let current_epoch = schedule.epoch_of(block);
    if payload.epoch_id != current_epoch {
        return Err(ApiError::bad_request(
            stages::WRONG_EPOCH,
            format!("epoch {} is not the current epoch {current_epoch}", payload.epoch_id),
        ));
    }
    if !schedule.accepts_commits(block) {
        return Err(ApiError::bad_request(
            stages::COMMIT_WINDOW_CLOSED,
            format!(
                "commits close at offset {}, gateway is at {}",
                schedule.submit_cutoff,
                schedule.offset_in_epoch(block)
            ),
        ));
    }

    let _batch = state.batch_lock.lock().await;
    if state
        .store()
        .commitments(payload.epoch_id, hotkey)
        .map_err(ApiError::internal)?
        .is_some()
    {
        return Err(ApiError::conflict(
            stages::DUPLICATE_SUBMISSION,
            format!("commit batch for epoch {} already received", payload.epoch_id),
        ));
    }

    let public: Vec<_> = payload
        .validations
        .iter()
        .map(|c| {
            json!({
                "lead_id": c.lead_id,
                "decision_hash": c.decision_hash,
                "rep_score_hash": c.rep_score_hash,
                "rejection_reason_hash": c.rejection_reason_hash,
                "evidence_hash": c.evidence_hash,
            })
        })
        .collect();
    let event = json!({
        "epoch_id": payload.epoch_id,
        "validator_hotkey": hotkey,
        "build_id": request.build_id,
        "validation_count": public.len(),
        "validations": public,
    });
    let entry = state
        .log_event(event_types::VALIDATION_COMMIT_BATCH, event, Some(&request.nonce))
        .await
        .map_err(log_rejection)?;

    state
        .store()
        .insert_commitments(payload.epoch_id, hotkey, &payload.validations)
        .map_err(|e| {
            if e.is_duplicate() {
                ApiError::conflict(stages::DUPLICATE_SUBMISSION, "concurrent commit batch")
            } else {
                ApiError::internal(e)
            }
        })?;

    tracing::info!(
        epoch_id = payload.epoch_id,
        hotkey = %hotkey,
        validations = payload.validations.len(),
        event_hash = %entry.event_hash,
        "commit batch accepted"
    );
    Ok(CommitAccepted {
        status: "accepted".to_string(),
        epoch_id: payload.epoch_id,
        validation_count: payload.validations.len(),
        event_hash: entry.event_hash,
        timestamp: entry.signed_event.timestamp,
    })
}

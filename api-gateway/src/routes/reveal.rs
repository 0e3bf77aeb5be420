//! `POST /reveal`: plaintext decisions for an epoch whose commits closed.

use std::collections::HashMap;

use axum::{Json, extract::State, http::StatusCode};
use serde_json::json;

use weight_core::canonical::constants::event_types;
use weight_core::canonical::{RevealError, verify_reveal};
use weight_core::epoch::RevealStatus;
use weight_core::storage::CommitmentStore;
use weight_core::{RevealAccepted, RevealRequest};

use crate::error::{ApiError, stages};
use crate::relay::record;
use crate::state::{AppState, SharedState};

pub async fn reveal(
    State(state): State<SharedState>,
    Json(request): Json<RevealRequest>,
) -> Result<Json<RevealAccepted>, ApiError> {
    let outcome = handle_reveal(&state, &request).await;
    record(&state, "reveal", &outcome);
    outcome.map(Json)
}

fn reveal_rejection(e: RevealError) -> ApiError {
    match e {
        RevealError::DecisionHashMismatch(_)
        | RevealError::RepScoreHashMismatch(_)
        | RevealError::RejectionReasonHashMismatch(_) => {
            ApiError::bad_request(stages::HASH_MISMATCH, e.to_string())
        }
        _ => ApiError::bad_request(stages::INVALID_REQUEST, e.to_string()),
    }
}

async fn handle_reveal(
    state: &AppState,
    request: &RevealRequest,
) -> Result<RevealAccepted, ApiError> {
    request.verify().map_err(|e| {
        ApiError::new(StatusCode::UNAUTHORIZED, stages::SIGNATURE_INVALID, e.to_string())
    })?;
    let hotkey = &request.validator_hotkey;
    if !state.config.hotkey_allowed(hotkey) {
        return Err(ApiError::forbidden(
            stages::UNAUTHORIZED_HOTKEY,
            "hotkey is not an authorized validator",
        ));
    }

    let payload = &request.payload;
    let block = state
        .clock
        .current_block()
        .await
        .map_err(ApiError::unavailable)?;
    match state.config.schedule.reveal_status(payload.epoch_id, block) {
        RevealStatus::Open => {}
        RevealStatus::NotYetOpen => {
            return Err(ApiError::bad_request(
                stages::EPOCH_NOT_CLOSED,
                format!("epoch {} has not closed", payload.epoch_id),
            ));
        }
        RevealStatus::DeadlinePassed | RevealStatus::Expired => {
            return Err(ApiError::bad_request(
                stages::REVEAL_EXPIRED,
                format!("reveal window for epoch {} has passed", payload.epoch_id),
            ));
        }
    }

    let _batch = state.batch_lock.lock().await;
    let store = state.store();
    let commitments = store
        .commitments(payload.epoch_id, hotkey)
        .map_err(ApiError::internal)?
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                stages::NO_COMMITMENT,
                format!("no commit batch for epoch {}", payload.epoch_id),
            )
        })?;
    if store
        .reveals(payload.epoch_id, hotkey)
        .map_err(ApiError::internal)?
        .is_some()
    {
        return Err(ApiError::conflict(
            stages::DUPLICATE_SUBMISSION,
            format!("epoch {} already revealed", payload.epoch_id),
        ));
    }

    if payload.reveals.is_empty() {
        return Err(ApiError::bad_request(stages::INVALID_REQUEST, "reveal batch is empty"));
    }
    let by_lead: HashMap<_, _> = commitments.iter().map(|c| (c.lead_id.as_str(), c)).collect();
    for r in &payload.reveals {
        let commitment = by_lead.get(r.lead_id.as_str()).ok_or_else(|| {
            ApiError::bad_request(
                stages::NO_COMMITMENT,
                format!("lead {} was not committed", r.lead_id),
            )
        })?;
        verify_reveal(commitment, r).map_err(reveal_rejection)?;
    }

    let event = json!({
        "epoch_id": payload.epoch_id,
        "validator_hotkey": hotkey,
        "reveal_count": payload.reveals.len(),
        "reveals": payload.reveals,
    });
    let entry = state
        .log_event(event_types::VALIDATION_REVEAL_BATCH, event, None)
        .await
        .map_err(ApiError::internal)?;
    store
        .insert_reveals(payload.epoch_id, hotkey, &payload.reveals)
        .map_err(|e| {
            if e.is_duplicate() {
                ApiError::conflict(stages::DUPLICATE_SUBMISSION, "concurrent reveal batch")
            } else {
                ApiError::internal(e)
            }
        })?;

    tracing::info!(
        epoch_id = payload.epoch_id,
        hotkey = %hotkey,
        reveals = payload.reveals.len(),
        "reveal batch accepted"
    );
    Ok(RevealAccepted {
        status: "accepted".to_string(),
        epoch_id: payload.epoch_id,
        reveal_count: payload.reveals.len(),
        event_hash: entry.event_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sp_core::{Pair, crypto::Ss58Codec};
    use weight_core::RevealPayload;
    use weight_core::canonical::{ValidationReveal, generate_salt};
    use weight_core::storage::{EventQuery, LogStore};

    use crate::routes::validate::commit;
    use crate::state::test_support::{Harness, commit_batch, harness, hotkey};

    async fn committed(h: &Harness, epoch_id: u64) -> Vec<ValidationReveal> {
        h.chain.set_block(epoch_id * 360 + 50);
        let (request, reveals) = commit_batch(epoch_id, &generate_salt());
        commit(State(h.state.clone()), Json(request)).await.unwrap();
        reveals
    }

    fn signed(epoch_id: u64, reveals: Vec<ValidationReveal>) -> RevealRequest {
        RevealRequest::sign(&hotkey(), RevealPayload { epoch_id, reveals }).unwrap()
    }

    #[tokio::test]
    async fn reveal_in_next_epoch_is_accepted_once() {
        let h = harness().await;
        let reveals = committed(&h, 10).await;

        let err = reveal(State(h.state.clone()), Json(signed(10, reveals.clone())))
            .await
            .unwrap_err();
        assert_eq!(err.stage, stages::EPOCH_NOT_CLOSED);

        h.chain.set_block(11 * 360 + 20);
        let Json(accepted) = reveal(State(h.state.clone()), Json(signed(10, reveals.clone())))
            .await
            .unwrap();
        assert_eq!(accepted.reveal_count, 2);
        let ss58 = hotkey().public().to_ss58check();
        assert_eq!(h.store.reveals(10, &ss58).unwrap().unwrap().len(), 2);

        let err = reveal(State(h.state), Json(signed(10, reveals)))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn late_or_altered_reveals_are_rejected() {
        let h = harness().await;
        let reveals = committed(&h, 10).await;

        h.chain.set_block(11 * 360 + 20);
        let mut altered = reveals.clone();
        altered[1].rep_score = 12;
        let err = reveal(State(h.state.clone()), Json(signed(10, altered)))
            .await
            .unwrap_err();
        assert_eq!(err.stage, stages::HASH_MISMATCH);

        let mut forged = signed(10, reveals.clone());
        forged.payload.reveals.pop();
        let err = reveal(State(h.state.clone()), Json(forged)).await.unwrap_err();
        assert_eq!(err.stage, stages::SIGNATURE_INVALID);

        let err = reveal(State(h.state.clone()), Json(signed(9, reveals.clone())))
            .await
            .unwrap_err();
        assert_eq!(err.stage, stages::REVEAL_EXPIRED);

        h.chain.set_block(12 * 360 + 5);
        let err = reveal(State(h.state), Json(signed(10, reveals)))
            .await
            .unwrap_err();
        assert_eq!(err.stage, stages::REVEAL_EXPIRED);
    }

    #[tokio::test]
    async fn concurrent_identical_reveals_are_logged_once() {
        let h = harness().await;
        let reveals = committed(&h, 10).await;
        h.chain.set_block(11 * 360 + 20);

        let request = signed(10, reveals);
        let (a, b) = tokio::join!(
            reveal(State(h.state.clone()), Json(request.clone())),
            reveal(State(h.state.clone()), Json(request)),
        );
        let conflicts = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(e) if e.status == StatusCode::CONFLICT))
            .count();
        assert_eq!((a.is_ok() as usize) + (b.is_ok() as usize), 1);
        assert_eq!(conflicts, 1);

        let page = h
            .store
            .events(&EventQuery {
                limit: 100,
                ..EventQuery::default()
            })
            .unwrap();
        let logged = page
            .events
            .iter()
            .filter(|e| e.event_type() == event_types::VALIDATION_REVEAL_BATCH)
            .count();
        assert_eq!(logged, 1);
    }
}

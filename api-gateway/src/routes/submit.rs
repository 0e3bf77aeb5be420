//! `POST /submit`: a miner's lead, relayed into the transparency log.

use axum::{Json, extract::State, http::StatusCode};
use chrono::{DateTime, Utc};
use serde_json::json;

use weight_core::canonical::canonical_hash;
use weight_core::canonical::constants::event_types;
use weight_core::{LeadAccepted, LeadRequest};

use crate::error::{ApiError, stages};
use crate::ratelimit::RateLimitError;
use crate::relay::{log_rejection, record, verify_envelope};
use crate::state::{AppState, SharedState};

pub async fn submit_lead(
    State(state): State<SharedState>,
    Json(request): Json<LeadRequest>,
) -> Result<Json<LeadAccepted>, ApiError> {
    let now = Utc::now();
    // Limits are keyed by the hotkey, so only a proven hotkey is charged.
    let outcome = match verify_envelope(&state, &request, event_types::LEAD_SUBMISSION, now) {
        Ok(()) => {
            let outcome = handle_lead(&state, &request, now).await;
            if let Err(e) = &outcome {
                if e.status.is_client_error() && e.stage != stages::RATE_LIMITED {
                    state.rate_limiter.record_rejection(&request.actor_hotkey, now);
                }
            }
            outcome
        }
        Err(e) => Err(e),
    };
    record(&state, "submit", &outcome);
    outcome.map(Json)
}

fn rate_limited(e: RateLimitError) -> ApiError {
    match e {
        RateLimitError::Poisoned => ApiError::internal(e),
        _ => ApiError::new(StatusCode::TOO_MANY_REQUESTS, stages::RATE_LIMITED, e.to_string()),
    }
}

async fn is_registered(state: &AppState, hotkey: &str) -> Result<bool, ApiError> {
    for netuid in &state.config.allowed_netuids {
        let hotkeys = state
            .chain
            .metagraph_hotkeys(*netuid)
            .await
            .map_err(ApiError::unavailable)?;
        if hotkeys.iter().any(|h| h == hotkey) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Runs after the envelope checks have proven `actor_hotkey`.
async fn handle_lead(
    state: &AppState,
    request: &LeadRequest,
    now: DateTime<Utc>,
) -> Result<LeadAccepted, ApiError> {
    let stats = state
        .rate_limiter
        .reserve(&request.actor_hotkey, now)
        .map_err(rate_limited)?;

    let payload = &request.payload;
    let computed = canonical_hash(&payload.lead).map_err(|e| {
        ApiError::bad_request(stages::INVALID_REQUEST, "lead is not encodable").with_detail(e)
    })?;
    if computed != payload.lead_blob_hash {
        return Err(ApiError::bad_request(
            stages::HASH_MISMATCH,
            "lead_blob_hash does not match the lead",
        ));
    }

    if !is_registered(state, &request.actor_hotkey).await? {
        return Err(ApiError::forbidden(
            stages::UNREGISTERED_HOTKEY,
            "hotkey is not registered on the subnet",
        ));
    }

    let event = json!({
        "lead_id": payload.lead_id,
        "lead_blob_hash": payload.lead_blob_hash,
        "miner_hotkey": request.actor_hotkey,
        "build_id": request.build_id,
    });
    let entry = state
        .log_event(event_types::LEAD_SUBMISSION, event, Some(&request.nonce))
        .await
        .map_err(log_rejection)?;

    tracing::debug!(lead_id = %payload.lead_id, miner = %request.actor_hotkey, "lead accepted");
    Ok(LeadAccepted {
        status: "accepted".to_string(),
        lead_id: payload.lead_id.clone(),
        event_hash: entry.event_hash,
        rate_limit_stats: stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use sp_core::{Pair, crypto::Ss58Codec, sr25519};
    use weight_core::LeadPayload;
    use weight_core::canonical::SignedRequest;
    use weight_core::storage::LogStore;

    use crate::state::test_support::harness;

    fn miner(seed: &str) -> sr25519::Pair {
        sr25519::Pair::from_string(seed, None).unwrap()
    }

    fn lead_request(pair: &sr25519::Pair, lead: Value) -> LeadRequest {
        let payload = LeadPayload {
            lead_id: "lead-42".into(),
            lead_blob_hash: canonical_hash(&lead).unwrap(),
            lead,
        };
        SignedRequest::sign(event_types::LEAD_SUBMISSION, pair, "miner-build", payload).unwrap()
    }

    #[tokio::test]
    async fn registered_miner_lead_is_logged_by_hash() {
        let h = harness().await;
        let bob = miner("//Bob");
        h.chain.set_hotkeys(71, vec![bob.public().to_ss58check()]);

        let request = lead_request(&bob, json!({"email": "a@b.co", "company": "Acme"}));
        let Json(accepted) = submit_lead(State(h.state.clone()), Json(request.clone()))
            .await
            .unwrap();
        assert_eq!(accepted.rate_limit_stats.submissions, 1);

        let entry = h.store.event(&accepted.event_hash).unwrap().unwrap();
        assert_eq!(
            entry.signed_event.payload["lead_blob_hash"],
            request.payload.lead_blob_hash
        );
        assert!(entry.signed_event.payload.get("lead").is_none());

        // Replaying the same request is caught by its nonce.
        let err = submit_lead(State(h.state.clone()), Json(request))
            .await
            .unwrap_err();
        assert_eq!(err.stage, stages::NONCE_REPLAY);

        // A fresh lead inside the cooldown is throttled.
        let again = lead_request(&bob, json!({"email": "c@d.co"}));
        let err = submit_lead(State(h.state), Json(again)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn forged_hotkey_does_not_touch_the_victims_limits() {
        let h = harness().await;
        let bob = miner("//Bob");
        let bob_ss58 = bob.public().to_ss58check();
        h.chain.set_hotkeys(71, vec![bob_ss58.clone()]);

        let mut forged = lead_request(&miner("//Mallory"), json!({"email": "m@x.co"}));
        forged.actor_hotkey = bob_ss58.clone();
        let err = submit_lead(State(h.state.clone()), Json(forged))
            .await
            .unwrap_err();
        assert_eq!(
            (err.status, err.stage),
            (StatusCode::UNAUTHORIZED, stages::SIGNATURE_INVALID)
        );

        let usage = h.state.rate_limiter.usage(&bob_ss58, Utc::now());
        assert_eq!((usage.submissions, usage.rejections), (0, 0));

        let request = lead_request(&bob, json!({"email": "a@b.co"}));
        let Json(accepted) = submit_lead(State(h.state), Json(request)).await.unwrap();
        assert_eq!(accepted.rate_limit_stats.submissions, 1);
    }

    #[tokio::test]
    async fn unregistered_or_tampered_leads_are_rejected() {
        let h = harness().await;
        let charlie = miner("//Charlie");
        let dave = miner("//Dave");
        h.chain.set_hotkeys(71, vec![dave.public().to_ss58check()]);

        let err = submit_lead(
            State(h.state.clone()),
            Json(lead_request(&charlie, json!({"email": "x@y.co"}))),
        )
        .await
        .unwrap_err();
        assert_eq!(
            (err.status, err.stage),
            (StatusCode::FORBIDDEN, stages::UNREGISTERED_HOTKEY)
        );
        let usage = h
            .state
            .rate_limiter
            .usage(&charlie.public().to_ss58check(), Utc::now());
        assert_eq!(usage.rejections, 1);

        let mut tampered = lead_request(&dave, json!({"email": "x@y.co"}));
        tampered.payload.lead = json!({"email": "other@y.co"});
        let err = submit_lead(State(h.state.clone()), Json(tampered))
            .await
            .unwrap_err();
        assert_eq!(err.stage, stages::HASH_MISMATCH);

        h.chain.set_unavailable(true);
        let eve = miner("//Eve");
        let err = submit_lead(
            State(h.state),
            Json(lead_request(&eve, json!({"email": "e@f.co"}))),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}

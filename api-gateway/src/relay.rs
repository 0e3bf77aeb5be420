//! Checks shared by the signed relay endpoints (`/validate`, `/submit`).

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Serialize;

use weight_core::canonical::{EnvelopeError, SignedRequest};
use weight_core::storage::LogStore;
use weight_core::transparency::LoggerError;

use crate::error::{ApiError, stages};
use crate::state::AppState;

/// Maps an envelope failure onto a rejection.
pub fn envelope_rejection(e: EnvelopeError) -> ApiError {
    match e {
        EnvelopeError::PayloadHashMismatch => {
            ApiError::bad_request(stages::HASH_MISMATCH, e.to_string())
        }
        EnvelopeError::Signature(_) => {
            ApiError::new(StatusCode::UNAUTHORIZED, stages::SIGNATURE_INVALID, e.to_string())
        }
        EnvelopeError::StaleTimestamp { .. } | EnvelopeError::BadTimestamp(_) => {
            ApiError::bad_request(stages::STALE_TIMESTAMP, e.to_string())
        }
        EnvelopeError::BadNonce(_) | EnvelopeError::Encoding(_) => {
            ApiError::bad_request(stages::INVALID_REQUEST, e.to_string())
        }
    }
}

/// Event type, payload hash, signature, nonce format and uniqueness, and
/// timestamp skew, in that order.
pub fn verify_envelope<P: Serialize>(
    state: &AppState,
    request: &SignedRequest<P>,
    event_type: &str,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    if request.event_type != event_type {
        return Err(ApiError::bad_request(
            stages::INVALID_REQUEST,
            format!("expected event_type {event_type}"),
        ));
    }
    request.verify_payload_hash().map_err(envelope_rejection)?;
    request.verify_signature().map_err(envelope_rejection)?;
    request.check_nonce_format().map_err(envelope_rejection)?;
    if state
        .store()
        .nonce_seen(&request.nonce)
        .map_err(ApiError::internal)?
    {
        return Err(nonce_replay());
    }
    request.check_timestamp(now).map_err(envelope_rejection)?;
    Ok(())
}

pub fn nonce_replay() -> ApiError {
    ApiError::conflict(stages::NONCE_REPLAY, "nonce already used")
}

/// A failed append under a request nonce; duplicates are replays.
pub fn log_rejection(e: LoggerError) -> ApiError {
    if e.is_duplicate() {
        nonce_replay()
    } else {
        ApiError::internal(e)
    }
}

/// Counts the outcome of one relay request.
pub fn record<T>(state: &AppState, endpoint: &str, outcome: &Result<T, ApiError>) {
    let stage = match outcome {
        Ok(_) => "accepted",
        Err(e) => e.stage,
    };
    state
        .metrics
        .gateway
        .relay_requests_total
        .with_label_values(&[endpoint, stage])
        .inc();
    if let Err(e) = outcome {
        tracing::info!(endpoint, stage, reason = %e.reason, "relay request rejected");
    }
}

//! Rejections returned by the ingress endpoints.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use weight_core::Rejection;

/// Machine-readable rejection stages.
pub mod stages {
    pub const INVALID_WEIGHTS: &str = "invalid_weights";
    pub const UNAUTHORIZED_HOTKEY: &str = "unauthorized_hotkey";
    pub const DUPLICATE_SUBMISSION: &str = "duplicate_submission";
    pub const STALE_SUBMISSION: &str = "stale_submission";
    pub const ATTESTATION_FAILED: &str = "attestation_failed";
    pub const BINDING_INVALID: &str = "binding_invalid";
    pub const SIGNATURE_INVALID: &str = "signature_invalid";
    pub const HASH_MISMATCH: &str = "hash_mismatch";
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const NONCE_REPLAY: &str = "nonce_replay";
    pub const STALE_TIMESTAMP: &str = "stale_timestamp";
    pub const WRONG_EPOCH: &str = "wrong_epoch";
    pub const COMMIT_WINDOW_CLOSED: &str = "commit_window_closed";
    pub const EPOCH_NOT_CLOSED: &str = "epoch_not_closed";
    pub const REVEAL_EXPIRED: &str = "reveal_expired";
    pub const NO_COMMITMENT: &str = "no_commitment";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const UNREGISTERED_HOTKEY: &str = "unregistered_hotkey";
    pub const CHAIN_UNAVAILABLE: &str = "chain_unavailable";
    pub const INTERNAL: &str = "internal";
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub stage: &'static str,
    pub reason: String,
    pub detail: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, stage: &'static str, reason: impl Into<String>) -> Self {
        Self {
            status,
            stage,
            reason: reason.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl ToString) -> Self {
        self.detail = Some(detail.to_string());
        self
    }

    pub fn bad_request(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, stage, reason)
    }

    pub fn forbidden(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, stage, reason)
    }

    pub fn conflict(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, stage, reason)
    }

    pub fn unavailable(detail: impl ToString) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            stages::CHAIN_UNAVAILABLE,
            "chain state unavailable",
        )
        .with_detail(detail)
    }

    pub fn internal(detail: impl ToString) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            stages::INTERNAL,
            "internal error",
        )
        .with_detail(detail)
    }

    pub fn rejection(&self) -> Rejection {
        Rejection {
            stage: self.stage.to_string(),
            reason: self.reason.clone(),
            detail: self.detail.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.rejection())).into_response()
    }
}

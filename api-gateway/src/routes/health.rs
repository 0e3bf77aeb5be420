use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use weight_core::storage::LogStore;

use crate::state::SharedState;

/// Liveness plus the current log session.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub boot_id: String,
    pub enclave_pubkey: String,
    pub log_tip_event_hash: Option<String>,
}

/// `GET /health`
///
/// Reports 503 when the log store cannot be read.
pub async fn health(State(state): State<SharedState>) -> (StatusCode, Json<HealthResponse>) {
    let tip = state.store().tip();
    let status = if tip.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if tip.is_ok() { "ok" } else { "degraded" },
            boot_id: state.logger.boot_id().to_string(),
            enclave_pubkey: state.attestation.enclave_pubkey.clone(),
            log_tip_event_hash: tip.ok().flatten().map(|e| e.event_hash),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::harness;

    #[tokio::test]
    async fn health_reports_the_boot_session() {
        let h = harness().await;
        let (status, Json(body)) = health(State(h.state.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.boot_id, h.state.logger.boot_id());
        assert!(body.log_tip_event_hash.is_some());
    }
}

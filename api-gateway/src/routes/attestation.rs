use axum::{Json, extract::State};

use weight_core::GatewayAttestation;

use crate::state::SharedState;

/// `GET /attestation/document`
///
/// The gateway's event-signing key and the attestation binding it.
pub async fn document(State(state): State<SharedState>) -> Json<GatewayAttestation> {
    Json(state.attestation.clone())
}

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

use weight_core::storage::BundleStore;
use weight_core::{PublishedBundle, SubmitAccepted, WeightSubmission};

use crate::error::ApiError;
use crate::state::SharedState;
use crate::verify::accept_submission;

/// `POST /weights/submit`
pub async fn submit(
    State(state): State<SharedState>,
    Json(submission): Json<WeightSubmission>,
) -> Result<Json<SubmitAccepted>, ApiError> {
    accept_submission(&state, &submission).await.map(Json)
}

fn found(bundle: Option<PublishedBundle>, what: String) -> Result<Json<PublishedBundle>, ApiError> {
    bundle.map(Json).ok_or_else(|| {
        ApiError::new(StatusCode::NOT_FOUND, "not_found", format!("no bundle for {what}"))
    })
}

/// `GET /weights/latest/{netuid}/{epoch_id}`
pub async fn latest(
    State(state): State<SharedState>,
    Path((netuid, epoch_id)): Path<(u64, u64)>,
) -> Result<Json<PublishedBundle>, ApiError> {
    let bundle = state
        .store()
        .latest_bundle(netuid, epoch_id)
        .map_err(ApiError::internal)?;
    found(bundle, format!("netuid {netuid} epoch {epoch_id}"))
}

/// `GET /weights/current/{netuid}`
pub async fn current(
    State(state): State<SharedState>,
    Path(netuid): Path<u64>,
) -> Result<Json<PublishedBundle>, ApiError> {
    let bundle = state
        .store()
        .current_bundle(netuid)
        .map_err(ApiError::internal)?;
    found(bundle, format!("netuid {netuid}"))
}

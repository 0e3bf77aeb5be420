//! HTTP routes.

pub mod attestation;
pub mod health;
pub mod reveal;
pub mod submit;
pub mod transparency;
pub mod validate;
pub mod weights;

use axum::{
    Router,
    routing::{get, post},
};

use crate::state::SharedState;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/attestation/document", get(attestation::document))
        .route("/weights/submit", post(weights::submit))
        .route("/weights/latest/{netuid}/{epoch_id}", get(weights::latest))
        .route("/weights/current/{netuid}", get(weights::current))
        .route(
            "/weights/transparency/event/{event_hash}",
            get(transparency::event),
        )
        .route("/event/{event_hash}", get(transparency::event))
        .route("/weights/transparency/events", get(transparency::events))
        .route("/validate", post(validate::commit))
        .route("/reveal", post(reveal::reveal))
        .route("/submit", post(submit::submit_lead))
        .with_state(state)
}

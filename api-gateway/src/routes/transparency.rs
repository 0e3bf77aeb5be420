use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;

use weight_core::storage::{EventQuery, LogStore, MAX_EVENT_PAGE};
use weight_core::EventsPage;
use weight_core::canonical::LogEntry;

use crate::error::ApiError;
use crate::state::SharedState;

/// `GET /weights/transparency/event/{event_hash}` (also `/event/{event_hash}`)
pub async fn event(
    State(state): State<SharedState>,
    Path(event_hash): Path<String>,
) -> Result<Json<LogEntry>, ApiError> {
    state
        .store()
        .event(&event_hash.to_ascii_lowercase())
        .map_err(ApiError::internal)?
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "not_found", "unknown event hash"))
}

#[derive(Debug, Deserialize)]
pub struct EventsParams {
    #[serde(default)]
    pub start_seq: u64,
    pub limit: Option<usize>,
    pub boot_id: Option<String>,
}

/// `GET /weights/transparency/events?start_seq&limit&boot_id`
pub async fn events(
    State(state): State<SharedState>,
    Query(params): Query<EventsParams>,
) -> Result<Json<EventsPage>, ApiError> {
    let query = EventQuery {
        start_seq: params.start_seq,
        limit: params.limit.unwrap_or(100).min(MAX_EVENT_PAGE),
        boot_id: params.boot_id,
    };
    let page = state.store().events(&query).map_err(ApiError::internal)?;
    Ok(Json(EventsPage {
        events: page.events,
        has_more: page.has_more,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::harness;
    use weight_core::canonical::constants::event_types;

    #[tokio::test]
    async fn events_page_and_lookup() {
        let h = harness().await;
        for i in 0..3 {
            h.state
                .log_event(event_types::ARWEAVE_CHECKPOINT, serde_json::json!({"i": i}), None)
                .await
                .unwrap();
        }

        let Json(page) = events(
            State(h.state.clone()),
            Query(EventsParams {
                start_seq: 2,
                limit: Some(2),
                boot_id: Some(h.state.logger.boot_id().to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(page.events.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.events[0].signed_event.monotonic_seq, 2);

        let hash = page.events[1].event_hash.clone();
        let Json(entry) = event(State(h.state.clone()), Path(hash.to_ascii_uppercase()))
            .await
            .unwrap();
        assert_eq!(entry.event_hash, hash);

        let err = event(State(h.state), Path("00".repeat(32))).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }
}

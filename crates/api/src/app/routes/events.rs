//! Lifecycle event ingestion for game servers and referees.
//!
//! Accepted events are put on the bus; the coordinator worker acts on them
//! asynchronously, so the response only acknowledges publication.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};

use wager_events::{EventBus, EventEnvelope, LifecycleEvent};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new().route("/", post(publish_event))
}

/// POST /events
pub async fn publish_event(
    Extension(services): Extension<Arc<AppServices>>,
    payload: Result<Json<LifecycleEvent>, JsonRejection>,
) -> Response {
    let event = match dto::body(payload) {
        Ok(e) => e,
        Err(resp) => return resp,
    };
    let coordinator = services.coordinator();
    let envelope = EventEnvelope::lifecycle(coordinator.topics(), event);
    let event_id = envelope.event_id();
    let topic = envelope.topic().to_string();

    match coordinator.bus().publish(envelope) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "eventId": event_id.to_string(), "topic": topic })),
        )
            .into_response(),
        Err(e) => errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", e),
    }
}

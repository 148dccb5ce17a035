use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use wager_core::{DomainError, TicketId};
use wager_matchmaking::LaneKey;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/seek", post(seek))
        .route("/seek/:ticket_id", get(get_ticket).delete(cancel_seek))
        .route("/queue/depth", get(queue_depth))
        .route("/queue/lanes", get(queue_lanes))
}

/// POST /seek
///
/// Enqueue a ticket, then run a matching cycle for its lane so a waiting
/// opponent is paired (and escrowed) before the response is sent.
pub async fn seek(
    Extension(services): Extension<Arc<AppServices>>,
    payload: Result<Json<dto::SeekBody>, JsonRejection>,
) -> Response {
    let request = match dto::body(payload).and_then(dto::SeekBody::into_request) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let ticket = match services.queue().seek(request) {
        Ok(t) => t,
        Err(e) => return errors::queue_error_to_response(e),
    };

    let formed = match services.coordinator().run_lane_cycle(&ticket.lane) {
        Ok(matches) => matches,
        Err(err) => {
            // The ticket is queued; the background matcher will retry the lane.
            tracing::warn!(lane = %ticket.lane, error = %err, "lane cycle after seek failed");
            Vec::new()
        }
    };
    let match_id = formed
        .iter()
        .find(|m| m.tickets.contains(&ticket.ticket_id))
        .map(|m| m.match_id.to_string());

    let current = match services.queue().get_ticket(ticket.ticket_id) {
        Ok(Some(t)) => t,
        Ok(None) => ticket,
        Err(e) => return errors::queue_error_to_response(e),
    };

    let mut body = dto::ticket_to_json(&current);
    body["matchId"] = serde_json::json!(match_id);
    (StatusCode::CREATED, Json(body)).into_response()
}

pub async fn get_ticket(
    Extension(services): Extension<Arc<AppServices>>,
    Path(raw): Path<String>,
) -> Response {
    let ticket_id: TicketId = match dto::parse_id("ticket id", &raw) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.queue().get_ticket(ticket_id) {
        Ok(Some(t)) => (StatusCode::OK, Json(dto::ticket_to_json(&t))).into_response(),
        Ok(None) => errors::domain_error_to_response(DomainError::not_found(format!("ticket {ticket_id}"))),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// DELETE /seek/:ticket_id
///
/// Idempotent: cancelling a ticket that is no longer seeking is a no-op.
pub async fn cancel_seek(
    Extension(services): Extension<Arc<AppServices>>,
    Path(raw): Path<String>,
) -> Response {
    let ticket_id: TicketId = match dto::parse_id("ticket id", &raw) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.queue().get_ticket(ticket_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return errors::domain_error_to_response(DomainError::not_found(format!("ticket {ticket_id}")));
        }
        Err(e) => return errors::queue_error_to_response(e),
    }
    match services.queue().cancel(ticket_id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn queue_depth(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<dto::QueueDepthParams>,
) -> Response {
    let lane: LaneKey = match params.lane.parse() {
        Ok(l) => l,
        Err(e) => return errors::domain_error_to_response(e),
    };
    match services.queue().depth(&lane) {
        Ok(depth) => (
            StatusCode::OK,
            Json(serde_json::json!({ "lane": lane.to_string(), "depth": depth })),
        )
            .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn queue_lanes(Extension(services): Extension<Arc<AppServices>>) -> Response {
    let queue = services.queue();
    let lanes = match queue.lanes() {
        Ok(l) => l,
        Err(e) => return errors::queue_error_to_response(e),
    };
    let mut items = Vec::with_capacity(lanes.len());
    for lane in lanes {
        match queue.depth(&lane) {
            Ok(depth) => items.push(serde_json::json!({ "lane": lane.to_string(), "depth": depth })),
            Err(e) => return errors::queue_error_to_response(e),
        }
    }
    (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
}

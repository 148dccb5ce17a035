use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};

use wager_core::{DomainError, MatchId};
use wager_matchmaking::Match;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/:match_id", get(get_match))
        .route("/:match_id/live", post(mark_live))
        .route("/:match_id/result", post(report_result))
        .route("/:match_id/refund", post(refund_match))
}

fn match_id(raw: &str) -> Result<MatchId, Response> {
    dto::parse_id("match id", raw)
}

fn ok(m: Match) -> Response {
    (StatusCode::OK, Json(dto::match_to_json(&m))).into_response()
}

pub async fn get_match(
    Extension(services): Extension<Arc<AppServices>>,
    Path(raw): Path<String>,
) -> Response {
    let id = match match_id(&raw) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.coordinator().get_match(id) {
        Ok(Some(m)) => ok(m),
        Ok(None) => errors::domain_error_to_response(DomainError::not_found(format!("match {id}"))),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

/// POST /matches/:match_id/live (game server reports the match started)
pub async fn mark_live(
    Extension(services): Extension<Arc<AppServices>>,
    Path(raw): Path<String>,
) -> Response {
    let id = match match_id(&raw) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    services
        .coordinator()
        .mark_live(id)
        .map_or_else(errors::coordinator_error_to_response, ok)
}

/// POST /matches/:match_id/result
///
/// Pays the winner. A retry with the same key and winner returns the settled
/// match; any other terminal request for the match is a conflict.
pub async fn report_result(
    Extension(services): Extension<Arc<AppServices>>,
    Path(raw): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<dto::ReportResultBody>, JsonRejection>,
) -> Response {
    let id = match match_id(&raw) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let body = match dto::body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let key = dto::idempotency_key(&headers, body.idempotency_key);
    services
        .coordinator()
        .report_result(id, body.winner_id, &key)
        .map_or_else(errors::coordinator_error_to_response, ok)
}

pub async fn refund_match(
    Extension(services): Extension<Arc<AppServices>>,
    Path(raw): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<dto::RefundMatchBody>, JsonRejection>,
) -> Response {
    let id = match match_id(&raw) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let body = match dto::body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    if body.reason.trim().is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "reason is required");
    }
    let key = dto::idempotency_key(&headers, body.idempotency_key);
    services
        .coordinator()
        .refund(id, &body.reason, &key)
        .map_or_else(errors::coordinator_error_to_response, ok)
}

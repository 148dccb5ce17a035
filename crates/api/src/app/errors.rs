use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use wager_core::DomainError;
use wager_infra::coordinator::CoordinatorError;
use wager_infra::ledger_engine::LedgerError;
use wager_infra::matchmaker::QueueError;

pub fn domain_error_to_response(err: DomainError) -> Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        e @ DomainError::InsufficientFunds { .. } => json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "insufficient_funds",
            e.to_string(),
        ),
        DomainError::DuplicateSeek(msg) => json_error(StatusCode::CONFLICT, "duplicate_seek", msg),
        DomainError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        DomainError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
    }
}

fn unavailable(msg: String) -> Response {
    tracing::error!(error = %msg, "storage unavailable");
    json_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg)
}

pub fn ledger_error_to_response(err: LedgerError) -> Response {
    match err {
        LedgerError::Domain(e) => domain_error_to_response(e),
        LedgerError::Fatal(msg) => unavailable(msg),
    }
}

pub fn queue_error_to_response(err: QueueError) -> Response {
    match err {
        QueueError::Domain(e) => domain_error_to_response(e),
        QueueError::Fatal(msg) => unavailable(msg),
    }
}

pub fn coordinator_error_to_response(err: CoordinatorError) -> Response {
    match err {
        CoordinatorError::Domain(e) => domain_error_to_response(e),
        CoordinatorError::Fatal(msg) => unavailable(msg),
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Rejection for path/query ids that do not parse.
pub fn bad_id(what: &str, raw: &str) -> Response {
    json_error(
        StatusCode::BAD_REQUEST,
        "invalid_id",
        format!("invalid {what} '{raw}'"),
    )
}

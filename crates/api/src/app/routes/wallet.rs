use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};

use wager_core::{DomainError, UserId};
use wager_infra::account_store::HistoryQuery;
use wager_infra::coordinator::CoordinatorError;
use wager_infra::ledger_engine::{LedgerError, LedgerReceipt};
use wager_ledger::{AccountOwner, RefType, Reference, TransactionState, TransactionType};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/:user_id/balance", get(get_balance))
        .route("/:user_id/history", get(get_history))
        .route("/lock", post(lock))
        .route("/unlock", post(unlock))
        .route("/payout", post(payout))
        .route("/refund", post(refund))
        .route("/transfer", post(transfer))
        .route("/earn", post(earn))
        .route("/deposit", post(deposit))
        .route("/withdraw", post(withdraw))
}

/// Match escrow belongs to the coordinator, which records the one terminal
/// call a match accepts. Generic locks may not touch it.
fn generic_reference(ref_type: RefType, ref_id: String) -> Result<Reference, Response> {
    if ref_type == RefType::Match {
        return Err(errors::domain_error_to_response(DomainError::validation(
            "MATCH references are locked by matchmaking; use /matches/{matchId}/result or /refund",
        )));
    }
    Ok(Reference::new(ref_type, ref_id))
}

fn match_response(result: Result<wager_matchmaking::Match, CoordinatorError>) -> Response {
    match result {
        Ok(m) => (StatusCode::OK, Json(dto::match_to_json(&m))).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

/// 201 for a fresh operation, 200 when the key was already processed.
fn receipt_response(result: Result<LedgerReceipt, LedgerError>) -> Response {
    match result {
        Ok(receipt) => {
            let status = if receipt.replayed {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, Json(dto::receipt_to_json(&receipt))).into_response()
        }
        Err(e) => errors::ledger_error_to_response(e),
    }
}

pub async fn get_balance(
    Extension(services): Extension<Arc<AppServices>>,
    Path(raw): Path<String>,
) -> Response {
    let user_id: UserId = match dto::parse_id("user id", &raw) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.ledger().balance(user_id) {
        Ok(b) => (StatusCode::OK, Json(dto::balance_to_json(&b))).into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}

pub async fn get_history(
    Extension(services): Extension<Arc<AppServices>>,
    Path(raw): Path<String>,
    Query(params): Query<dto::HistoryParams>,
) -> Response {
    let user_id: UserId = match dto::parse_id("user id", &raw) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let tx_type = match params.tx_type.as_deref().map(str::parse::<TransactionType>).transpose() {
        Ok(t) => t,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let state = match params.state.as_deref().map(str::parse::<TransactionState>).transpose() {
        Ok(s) => s,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let query = HistoryQuery::new(params.cursor, params.limit)
        .with_type(tx_type)
        .with_state(state);

    match services.ledger().history(user_id, &query) {
        Ok(page) => (StatusCode::OK, Json(dto::history_to_json(&page))).into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}

pub async fn lock(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    payload: Result<Json<dto::WalletLockBody>, JsonRejection>,
) -> Response {
    let body = match dto::body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let reference = match generic_reference(body.ref_type, body.ref_id) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let key = dto::idempotency_key(&headers, body.idempotency_key);
    receipt_response(services.ledger().lock(body.user_id, body.amount_minor, reference, &key))
}

pub async fn unlock(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    payload: Result<Json<dto::WalletUnlockBody>, JsonRejection>,
) -> Response {
    let body = match dto::body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let reference = match generic_reference(body.ref_type, body.ref_id) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let key = dto::idempotency_key(&headers, body.idempotency_key);
    receipt_response(services.ledger().unlock(body.user_id, body.amount_minor, reference, &key))
}

/// Same as `POST /matches/{id}/result`: answers with the match.
pub async fn payout(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    payload: Result<Json<dto::WalletPayoutBody>, JsonRejection>,
) -> Response {
    let body = match dto::body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let key = dto::idempotency_key(&headers, body.idempotency_key);
    match_response(
        services
            .coordinator()
            .report_result(body.match_id, body.winner_id, &key),
    )
}

/// Same as `POST /matches/{id}/refund`: answers with the match.
pub async fn refund(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    payload: Result<Json<dto::WalletRefundBody>, JsonRejection>,
) -> Response {
    let body = match dto::body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let key = dto::idempotency_key(&headers, body.idempotency_key);
    let reason = body.reason.unwrap_or_else(|| "wallet_refund".to_string());
    match_response(services.coordinator().refund(body.match_id, &reason, &key))
}

pub async fn transfer(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    payload: Result<Json<dto::WalletTransferBody>, JsonRejection>,
) -> Response {
    let body = match dto::body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let key = dto::idempotency_key(&headers, body.idempotency_key);
    receipt_response(services.ledger().transfer(
        body.from_user_id,
        body.to_user_id,
        body.amount_minor,
        body.note,
        &key,
    ))
}

pub async fn earn(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    payload: Result<Json<dto::WalletEarnBody>, JsonRejection>,
) -> Response {
    let body = match dto::body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let reference = body.reference();
    let key = dto::idempotency_key(&headers, body.idempotency_key);
    receipt_response(services.ledger().earn(
        body.user_id,
        body.amount_minor,
        body.reason,
        reference,
        &key,
    ))
}

pub async fn deposit(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    payload: Result<Json<dto::WalletDepositBody>, JsonRejection>,
) -> Response {
    let body = match dto::body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let owner = match (body.user_id, body.house_label) {
        (Some(user_id), None) => AccountOwner::user(user_id),
        (None, Some(label)) => AccountOwner::house(label),
        _ => {
            return errors::domain_error_to_response(DomainError::validation(
                "exactly one of userId or houseLabel is required",
            ));
        }
    };
    let key = dto::idempotency_key(&headers, body.idempotency_key);
    receipt_response(services.ledger().deposit(owner, body.amount_minor, body.external_ref, &key))
}

pub async fn withdraw(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    payload: Result<Json<dto::WalletWithdrawBody>, JsonRejection>,
) -> Response {
    let body = match dto::body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let key = dto::idempotency_key(&headers, body.idempotency_key);
    receipt_response(services.ledger().withdraw(
        body.user_id,
        body.amount_minor,
        body.external_ref,
        &key,
    ))
}

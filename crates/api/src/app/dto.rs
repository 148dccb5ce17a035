use std::str::FromStr;

use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use serde::Deserialize;
use serde_json::{Value, json};

use wager_core::{MatchId, MinorUnits, UserId};
use wager_infra::account_store::HistoryPage;
use wager_infra::ledger_engine::{Balance, LedgerReceipt};
use wager_ledger::{RefType, Reference, Transaction};
use wager_matchmaking::{EloBand, Match, SeekRequest, SeekTicket};

use crate::app::errors;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SeekBody {
    pub user_id: UserId,
    pub game_id: String,
    pub mode: wager_matchmaking::Mode,
    pub stake_minor: MinorUnits,
    pub region: String,
    pub elo_band: String,
    pub ping_hint: Option<u32>,
}

impl SeekBody {
    pub fn into_request(self) -> Result<SeekRequest, Response> {
        let elo_band = EloBand::from_str(&self.elo_band).map_err(errors::domain_error_to_response)?;
        Ok(SeekRequest {
            user_id: self.user_id,
            game_id: self.game_id,
            mode: self.mode,
            stake_minor: self.stake_minor,
            region: self.region,
            elo_band,
            ping_hint: self.ping_hint,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct QueueDepthParams {
    pub lane: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReportResultBody {
    pub winner_id: UserId,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RefundMatchBody {
    pub reason: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WalletLockBody {
    pub user_id: UserId,
    pub amount_minor: MinorUnits,
    pub ref_type: RefType,
    pub ref_id: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WalletUnlockBody {
    pub user_id: UserId,
    /// Absent: release everything still locked for the reference.
    pub amount_minor: Option<MinorUnits>,
    pub ref_type: RefType,
    pub ref_id: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WalletPayoutBody {
    pub match_id: MatchId,
    pub winner_id: UserId,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WalletRefundBody {
    pub match_id: MatchId,
    pub reason: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WalletTransferBody {
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub amount_minor: MinorUnits,
    pub note: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WalletEarnBody {
    pub user_id: UserId,
    pub amount_minor: MinorUnits,
    pub reason: String,
    pub ref_type: Option<RefType>,
    pub ref_id: Option<String>,
    pub idempotency_key: Option<String>,
}

impl WalletEarnBody {
    pub fn reference(&self) -> Option<Reference> {
        match (self.ref_type, &self.ref_id) {
            (Some(ref_type), Some(ref_id)) => Some(Reference::new(ref_type, ref_id.clone())),
            _ => None,
        }
    }
}

/// Deposit into a user wallet, or into a house account when `houseLabel` is set.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WalletDepositBody {
    pub user_id: Option<UserId>,
    pub house_label: Option<String>,
    pub amount_minor: MinorUnits,
    pub external_ref: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WalletWithdrawBody {
    pub user_id: UserId,
    pub amount_minor: MinorUnits,
    pub external_ref: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub cursor: Option<u64>,
    pub limit: Option<usize>,
    #[serde(rename = "type")]
    pub tx_type: Option<String>,
    pub state: Option<String>,
}

// -------------------------
// Request helpers
// -------------------------

/// Unwrap a JSON body, reporting malformed input as a 400 validation error.
pub fn body<T>(payload: Result<axum::Json<T>, JsonRejection>) -> Result<T, Response> {
    payload.map(|axum::Json(v)| v).map_err(|rejection| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            rejection.body_text(),
        )
    })
}

/// `Idempotency-Key` header, else the body field, else a fresh UUIDv7.
pub fn idempotency_key(headers: &HeaderMap, from_body: Option<String>) -> String {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or(from_body.filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string())
}

pub fn parse_id<T: FromStr>(what: &str, raw: &str) -> Result<T, Response> {
    raw.parse().map_err(|_| errors::bad_id(what, raw))
}

// -------------------------
// Response mapping
// -------------------------

pub fn ticket_to_json(ticket: &SeekTicket) -> Value {
    json!({
        "ticketId": ticket.ticket_id.to_string(),
        "userId": ticket.user_id.to_string(),
        "laneKey": ticket.lane.to_string(),
        "state": ticket.state.as_str(),
        "enqueuedAtMs": ticket.enqueued_at_ms,
        "pingHint": ticket.ping_hint,
        "round": ticket.round,
    })
}

pub fn match_to_json(m: &Match) -> Value {
    json!({
        "matchId": m.match_id.to_string(),
        "gameId": m.game_id,
        "mode": m.mode.as_str(),
        "region": m.region,
        "players": m.players.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "tickets": m.tickets.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "stakeMinor": m.stake_minor,
        "potMinor": m.pot_minor(),
        "status": m.status.as_str(),
        "resolution": m.resolution,
        "failureReason": m.failure_reason,
        "version": m.version,
        "createdAt": m.created_at.to_rfc3339(),
        "updatedAt": m.updated_at.to_rfc3339(),
    })
}

pub fn transaction_to_json(tx: &Transaction) -> Value {
    json!({
        "id": tx.id.to_string(),
        "seq": tx.seq,
        "operationId": tx.operation_id.to_string(),
        "type": tx.tx_type.as_str(),
        "state": tx.state.as_str(),
        "accountId": tx.account_id.to_string(),
        "amountMinor": tx.amount_minor,
        "availableDeltaMinor": tx.available_delta_minor,
        "lockedDeltaMinor": tx.locked_delta_minor,
        "counterAccountId": tx.counter_account_id.map(|id| id.to_string()),
        "refType": tx.ref_type.map(RefType::as_str),
        "refId": tx.ref_id,
        "idempotencyKey": tx.idempotency_key,
        "balanceAfterMinor": tx.balance_after_minor,
        "lockedAfterMinor": tx.locked_after_minor,
        "note": tx.note,
        "createdAt": tx.created_at.to_rfc3339(),
    })
}

pub fn receipt_to_json(receipt: &LedgerReceipt) -> Value {
    json!({
        "operationId": receipt.operation_id.to_string(),
        "transactionId": receipt.transaction_id().to_string(),
        "type": receipt.tx_type.as_str(),
        "replayed": receipt.replayed,
        "newAvailableMinor": receipt.new_available_minor(),
        "newLockedMinor": receipt.new_locked_minor(),
        "transactions": receipt.transactions.iter().map(transaction_to_json).collect::<Vec<_>>(),
    })
}

pub fn balance_to_json(balance: &Balance) -> Value {
    json!({
        "userId": balance.user_id.to_string(),
        "currency": balance.currency.as_str(),
        "decimals": balance.decimals,
        "availableMinor": balance.available_minor,
        "lockedMinor": balance.locked_minor,
        "totalMinor": balance.total_minor,
        "totalDepositedMinor": balance.total_deposited_minor,
        "totalWithdrawnMinor": balance.total_withdrawn_minor,
    })
}

pub fn history_to_json(page: &HistoryPage) -> Value {
    json!({
        "items": page.items.iter().map(transaction_to_json).collect::<Vec<_>>(),
        "nextCursor": page.next_cursor,
        "hasMore": page.has_more,
    })
}

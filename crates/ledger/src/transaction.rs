use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wager_core::{AccountId, DomainError, MatchId, MinorUnits, OperationId, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Lock,
    Unlock,
    Payout,
    Refund,
    Transfer,
    Earn,
    Deposit,
    Withdraw,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::Lock => "LOCK",
            TransactionType::Unlock => "UNLOCK",
            TransactionType::Payout => "PAYOUT",
            TransactionType::Refund => "REFUND",
            TransactionType::Transfer => "TRANSFER",
            TransactionType::Earn => "EARN",
            TransactionType::Deposit => "DEPOSIT",
            TransactionType::Withdraw => "WITHDRAW",
        }
    }
}

impl core::str::FromStr for TransactionType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOCK" => Ok(TransactionType::Lock),
            "UNLOCK" => Ok(TransactionType::Unlock),
            "PAYOUT" => Ok(TransactionType::Payout),
            "REFUND" => Ok(TransactionType::Refund),
            "TRANSFER" => Ok(TransactionType::Transfer),
            "EARN" => Ok(TransactionType::Earn),
            "DEPOSIT" => Ok(TransactionType::Deposit),
            "WITHDRAW" => Ok(TransactionType::Withdraw),
            other => Err(DomainError::validation(format!("unknown transaction type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Pending,
    Completed,
    Failed,
}

impl TransactionState {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionState::Pending => "PENDING",
            TransactionState::Completed => "COMPLETED",
            TransactionState::Failed => "FAILED",
        }
    }
}

impl core::str::FromStr for TransactionState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TransactionState::Pending),
            "COMPLETED" => Ok(TransactionState::Completed),
            "FAILED" => Ok(TransactionState::Failed),
            other => Err(DomainError::validation(format!("unknown transaction state '{other}'"))),
        }
    }
}

/// What a locked amount (or a reward) is held for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefType {
    Match,
    Tournament,
    Prop,
    Reward,
    External,
}

impl RefType {
    pub fn as_str(self) -> &'static str {
        match self {
            RefType::Match => "MATCH",
            RefType::Tournament => "TOURNAMENT",
            RefType::Prop => "PROP",
            RefType::Reward => "REWARD",
            RefType::External => "EXTERNAL",
        }
    }
}

impl core::str::FromStr for RefType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MATCH" => Ok(RefType::Match),
            "TOURNAMENT" => Ok(RefType::Tournament),
            "PROP" => Ok(RefType::Prop),
            "REWARD" => Ok(RefType::Reward),
            "EXTERNAL" => Ok(RefType::External),
            other => Err(DomainError::validation(format!("unknown ref type '{other}'"))),
        }
    }
}

/// `(refType, refId)` pair that scopes locks and escrow lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub ref_type: RefType,
    pub ref_id: String,
}

impl Reference {
    pub fn new(ref_type: RefType, ref_id: impl Into<String>) -> Self {
        Self {
            ref_type,
            ref_id: ref_id.into(),
        }
    }

    pub fn for_match(match_id: MatchId) -> Self {
        Self::new(RefType::Match, match_id.to_string())
    }
}

/// Immutable ledger row: the effect of one operation on one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    /// Store-assigned, strictly increasing position (pagination cursor).
    pub seq: u64,
    pub operation_id: OperationId,
    pub tx_type: TransactionType,
    pub state: TransactionState,
    pub account_id: AccountId,
    pub amount_minor: MinorUnits,
    pub available_delta_minor: MinorUnits,
    pub locked_delta_minor: MinorUnits,
    pub counter_account_id: Option<AccountId>,
    pub ref_type: Option<RefType>,
    pub ref_id: Option<String>,
    pub idempotency_key: String,
    /// Available balance after this row.
    pub balance_after_minor: MinorUnits,
    pub locked_after_minor: MinorUnits,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn reference(&self) -> Option<Reference> {
        match (self.ref_type, &self.ref_id) {
            (Some(ref_type), Some(ref_id)) => Some(Reference::new(ref_type, ref_id.clone())),
            _ => None,
        }
    }
}

/// The idempotency claim for one logical operation, with the rows it wrote.
///
/// `(idempotency_key, tx_type)` is unique across the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation_id: OperationId,
    pub idempotency_key: String,
    pub tx_type: TransactionType,
    pub fingerprint: String,
    pub primary_account_id: AccountId,
    pub transactions: Vec<Transaction>,
    pub created_at: DateTime<Utc>,
}

impl OperationRecord {
    /// Row written for the operation's primary account.
    pub fn primary(&self) -> Option<&Transaction> {
        self.transactions
            .iter()
            .find(|t| t.account_id == self.primary_account_id)
            .or_else(|| self.transactions.first())
    }

    pub fn entry_for(&self, account_id: AccountId) -> Option<&Transaction> {
        self.transactions.iter().find(|t| t.account_id == account_id)
    }
}

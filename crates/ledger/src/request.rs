use serde::{Deserialize, Serialize};

use wager_core::{DomainError, DomainResult, MatchId, MinorUnits, UserId};

use crate::account::AccountOwner;
use crate::transaction::{Reference, TransactionType};

/// A money operation as requested by a caller, before any state is read.
///
/// The idempotency claim is keyed by `(key, tx_type())` and bound to
/// `fingerprint()`, so a retry carrying the same key must also carry the same
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerRequest {
    Lock {
        user_id: UserId,
        amount_minor: MinorUnits,
        reference: Reference,
    },
    /// `amount_minor = None` releases everything locked for the reference.
    Unlock {
        user_id: UserId,
        amount_minor: Option<MinorUnits>,
        reference: Reference,
    },
    Payout {
        match_id: MatchId,
        winner_id: UserId,
    },
    Refund {
        match_id: MatchId,
    },
    Transfer {
        from_user_id: UserId,
        to_user_id: UserId,
        amount_minor: MinorUnits,
        note: Option<String>,
    },
    Earn {
        user_id: UserId,
        amount_minor: MinorUnits,
        reason: String,
        reference: Option<Reference>,
    },
    Deposit {
        owner: AccountOwner,
        amount_minor: MinorUnits,
        external_ref: Option<String>,
    },
    Withdraw {
        user_id: UserId,
        amount_minor: MinorUnits,
        external_ref: Option<String>,
    },
}

impl LedgerRequest {
    pub fn tx_type(&self) -> TransactionType {
        match self {
            LedgerRequest::Lock { .. } => TransactionType::Lock,
            LedgerRequest::Unlock { .. } => TransactionType::Unlock,
            LedgerRequest::Payout { .. } => TransactionType::Payout,
            LedgerRequest::Refund { .. } => TransactionType::Refund,
            LedgerRequest::Transfer { .. } => TransactionType::Transfer,
            LedgerRequest::Earn { .. } => TransactionType::Earn,
            LedgerRequest::Deposit { .. } => TransactionType::Deposit,
            LedgerRequest::Withdraw { .. } => TransactionType::Withdraw,
        }
    }

    /// Stateless checks: positive amounts, no self-transfer, non-empty reason.
    pub fn validate(&self) -> DomainResult<()> {
        let amount = match self {
            LedgerRequest::Lock { amount_minor, .. }
            | LedgerRequest::Transfer { amount_minor, .. }
            | LedgerRequest::Earn { amount_minor, .. }
            | LedgerRequest::Deposit { amount_minor, .. }
            | LedgerRequest::Withdraw { amount_minor, .. } => Some(*amount_minor),
            LedgerRequest::Unlock { amount_minor, .. } => *amount_minor,
            LedgerRequest::Payout { .. } | LedgerRequest::Refund { .. } => None,
        };
        if let Some(amount) = amount {
            if amount <= 0 {
                return Err(DomainError::validation("amount must be positive"));
            }
        }

        match self {
            LedgerRequest::Transfer {
                from_user_id,
                to_user_id,
                ..
            } if from_user_id == to_user_id => {
                Err(DomainError::validation("cannot transfer to self"))
            }
            LedgerRequest::Earn { reason, .. } if reason.trim().is_empty() => {
                Err(DomainError::validation("earn reason is required"))
            }
            LedgerRequest::Lock { reference, .. } | LedgerRequest::Unlock { reference, .. }
                if reference.ref_id.trim().is_empty() =>
            {
                Err(DomainError::validation("reference id is required"))
            }
            _ => Ok(()),
        }
    }

    /// Canonical rendering of the request parameters.
    pub fn fingerprint(&self) -> String {
        fn opt(v: &Option<impl ToString>) -> String {
            v.as_ref().map(ToString::to_string).unwrap_or_default()
        }
        fn reference(r: &Reference) -> String {
            format!("{}:{}", r.ref_type.as_str(), r.ref_id)
        }

        let body = match self {
            LedgerRequest::Lock {
                user_id,
                amount_minor,
                reference: r,
            } => format!("{user_id}|{amount_minor}|{}", reference(r)),
            LedgerRequest::Unlock {
                user_id,
                amount_minor,
                reference: r,
            } => format!("{user_id}|{}|{}", opt(amount_minor), reference(r)),
            LedgerRequest::Payout {
                match_id,
                winner_id,
            } => format!("{match_id}|{winner_id}"),
            LedgerRequest::Refund { match_id } => match_id.to_string(),
            LedgerRequest::Transfer {
                from_user_id,
                to_user_id,
                amount_minor,
                note,
            } => format!("{from_user_id}|{to_user_id}|{amount_minor}|{}", opt(note)),
            LedgerRequest::Earn {
                user_id,
                amount_minor,
                reason,
                reference: r,
            } => format!(
                "{user_id}|{amount_minor}|{reason}|{}",
                r.as_ref().map(reference).unwrap_or_default()
            ),
            LedgerRequest::Deposit {
                owner,
                amount_minor,
                external_ref,
            } => format!("{owner}|{amount_minor}|{}", opt(external_ref)),
            LedgerRequest::Withdraw {
                user_id,
                amount_minor,
                external_ref,
            } => format!("{user_id}|{amount_minor}|{}", opt(external_ref)),
        };
        format!("{}|{body}", self.tx_type().as_str())
    }
}

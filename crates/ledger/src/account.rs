use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wager_core::{AccountId, AggregateRoot, Currency, DomainError, DomainResult, MinorUnits, UserId};

/// House account receiving platform fees.
pub const HOUSE_OPERATIONS: &str = "OPERATIONS";
/// House account funding `earn` credits.
pub const HOUSE_REWARDS: &str = "REWARDS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountType {
    House,
    User,
}

impl AccountType {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountType::House => "HOUSE",
            AccountType::User => "USER",
        }
    }
}

/// Natural key of an account within one currency.
///
/// One HOUSE account per (label, currency), one USER account per (user, currency).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AccountOwner {
    House { label: String },
    User { user_id: UserId },
}

impl AccountOwner {
    pub fn house(label: impl Into<String>) -> Self {
        AccountOwner::House {
            label: label.into(),
        }
    }

    pub fn user(user_id: UserId) -> Self {
        AccountOwner::User { user_id }
    }
}

impl core::fmt::Display for AccountOwner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AccountOwner::House { label } => write!(f, "house:{label}"),
            AccountOwner::User { user_id } => write!(f, "user:{user_id}"),
        }
    }
}

/// Which side of an account a posting line touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Bucket {
    Available,
    Locked,
}

/// Balance-holding account. Invariant: both buckets are never negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub account_type: AccountType,
    pub label: Option<String>,
    pub user_id: Option<UserId>,
    pub currency: Currency,
    pub decimals: u8,
    pub available_minor: MinorUnits,
    pub locked_minor: MinorUnits,
    pub total_deposited_minor: MinorUnits,
    pub total_withdrawn_minor: MinorUnits,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Fresh zero-balance account for an owner.
    pub fn open(owner: &AccountOwner, currency: Currency) -> Self {
        let (account_type, label, user_id) = match owner {
            AccountOwner::House { label } => (AccountType::House, Some(label.clone()), None),
            AccountOwner::User { user_id } => (AccountType::User, None, Some(*user_id)),
        };
        Self {
            id: AccountId::new(),
            account_type,
            label,
            user_id,
            currency,
            decimals: currency.decimals(),
            available_minor: 0,
            locked_minor: 0,
            total_deposited_minor: 0,
            total_withdrawn_minor: 0,
            version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn owner(&self) -> AccountOwner {
        match (self.account_type, &self.label, self.user_id) {
            (AccountType::User, _, Some(user_id)) => AccountOwner::User { user_id },
            (_, Some(label), _) => AccountOwner::House {
                label: label.clone(),
            },
            // A HOUSE row always has a label; fall back to an empty one rather than panic.
            _ => AccountOwner::House {
                label: String::new(),
            },
        }
    }

    pub fn total_minor(&self) -> MinorUnits {
        self.available_minor.saturating_add(self.locked_minor)
    }

    pub fn bucket(&self, bucket: Bucket) -> MinorUnits {
        match bucket {
            Bucket::Available => self.available_minor,
            Bucket::Locked => self.locked_minor,
        }
    }

    /// Apply a signed delta to one bucket, refusing to go negative.
    pub(crate) fn adjust(&mut self, bucket: Bucket, delta: MinorUnits) -> DomainResult<()> {
        let current = self.bucket(bucket);
        let next = current
            .checked_add(delta)
            .ok_or_else(|| DomainError::invariant("balance overflow"))?;
        if next < 0 {
            return Err(match bucket {
                Bucket::Available => DomainError::insufficient_funds(current, -delta),
                Bucket::Locked => DomainError::invariant(format!(
                    "locked balance of account {} would become negative",
                    self.id
                )),
            });
        }
        match bucket {
            Bucket::Available => self.available_minor = next,
            Bucket::Locked => self.locked_minor = next,
        }
        Ok(())
    }
}

impl AggregateRoot for Account {
    type Id = AccountId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_user_account_uses_currency_scale() {
        let user = UserId::new();
        let acct = Account::open(&AccountOwner::user(user), Currency::Usdc);
        assert_eq!(acct.account_type, AccountType::User);
        assert_eq!(acct.user_id, Some(user));
        assert_eq!(acct.decimals, 6);
        assert_eq!(acct.owner(), AccountOwner::user(user));
    }

    #[test]
    fn available_cannot_go_negative() {
        let mut acct = Account::open(&AccountOwner::user(UserId::new()), Currency::Fc);
        acct.available_minor = 100;
        let err = acct.adjust(Bucket::Available, -101).unwrap_err();
        assert_eq!(err, DomainError::insufficient_funds(100, 101));
        assert_eq!(acct.available_minor, 100);
    }
}

//! Double-entry postings over account buckets.
//!
//! A posting is the planned effect of one ledger operation: a set of debit and
//! credit lines against `available`/`locked` buckets. Internal movements must
//! balance (Σdebits = Σcredits); only deposits and withdrawals cross the
//! ledger boundary, and they are tagged as such.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use wager_core::{AccountId, DomainError, DomainResult, MinorUnits};

use crate::account::{Account, Bucket};
use crate::transaction::{Reference, TransactionType};

/// One side of a posting (immutable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingLine {
    pub account_id: AccountId,
    pub bucket: Bucket,
    /// Positive amount in minor units.
    pub amount: MinorUnits,
    /// true = debit (bucket decreases), false = credit (bucket increases).
    pub is_debit: bool,
}

impl PostingLine {
    pub fn debit(account_id: AccountId, bucket: Bucket, amount: MinorUnits) -> Self {
        Self {
            account_id,
            bucket,
            amount,
            is_debit: true,
        }
    }

    pub fn credit(account_id: AccountId, bucket: Bucket, amount: MinorUnits) -> Self {
        Self {
            account_id,
            bucket,
            amount,
            is_debit: false,
        }
    }

    fn signed(&self) -> MinorUnits {
        if self.is_debit { -self.amount } else { self.amount }
    }
}

/// Whether the posting must conserve money inside the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Balancing {
    /// Σdebits = Σcredits.
    Balanced,
    /// Funds arriving from outside (deposit): credits to `available` only.
    ExternalInflow,
    /// Funds leaving the ledger (withdrawal): debits from `available` only.
    ExternalOutflow,
}

/// Planned effect of one ledger operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub tx_type: TransactionType,
    pub lines: Vec<PostingLine>,
    pub balancing: Balancing,
    /// Account whose row is returned as "the" transaction of the operation.
    pub primary_account_id: AccountId,
    pub reference: Option<Reference>,
    pub note: Option<String>,
    /// Request parameters the idempotency claim is bound to.
    pub fingerprint: String,
}

impl Posting {
    pub fn validate(&self) -> DomainResult<()> {
        if self.lines.is_empty() {
            return Err(DomainError::validation("posting must have lines"));
        }

        let mut debit_total: i128 = 0;
        let mut credit_total: i128 = 0;

        for line in &self.lines {
            if line.amount <= 0 {
                return Err(DomainError::validation("amount must be positive"));
            }
            if line.is_debit {
                debit_total += i128::from(line.amount);
            } else {
                credit_total += i128::from(line.amount);
            }
        }

        match self.balancing {
            Balancing::Balanced => {
                if debit_total != credit_total {
                    return Err(DomainError::invariant("debits must equal credits"));
                }
            }
            Balancing::ExternalInflow => {
                let ok = self
                    .lines
                    .iter()
                    .all(|l| !l.is_debit && l.bucket == Bucket::Available);
                if !ok {
                    return Err(DomainError::invariant(
                        "external inflow may only credit available balances",
                    ));
                }
            }
            Balancing::ExternalOutflow => {
                let ok = self
                    .lines
                    .iter()
                    .all(|l| l.is_debit && l.bucket == Bucket::Available);
                if !ok {
                    return Err(DomainError::invariant(
                        "external outflow may only debit available balances",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Distinct accounts touched, ascending. Stores lock/version in this order.
    pub fn account_ids(&self) -> Vec<AccountId> {
        let mut ids: Vec<AccountId> = self.lines.iter().map(|l| l.account_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Net effect of a posting on one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryEffect {
    pub account_id: AccountId,
    pub amount_minor: MinorUnits,
    pub available_delta_minor: MinorUnits,
    pub locked_delta_minor: MinorUnits,
    pub available_after_minor: MinorUnits,
    pub locked_after_minor: MinorUnits,
    pub counter_account_id: Option<AccountId>,
}

/// Apply a validated posting to the given account snapshots, all or nothing.
///
/// On success every touched account has its buckets, deposit/withdraw totals
/// and version updated in `accounts`, and one `EntryEffect` per account is
/// returned in ascending account order. On failure `accounts` is untouched.
pub fn apply_posting(
    posting: &Posting,
    accounts: &mut BTreeMap<AccountId, Account>,
) -> DomainResult<Vec<EntryEffect>> {
    posting.validate()?;

    let ids = posting.account_ids();
    let mut staged: Vec<(Account, EntryEffect)> = Vec::with_capacity(ids.len());

    for id in &ids {
        let mut account = accounts
            .get(id)
            .cloned()
            .ok_or_else(|| DomainError::not_found(format!("account {id}")))?;

        let mut available_delta: MinorUnits = 0;
        let mut locked_delta: MinorUnits = 0;
        for line in posting.lines.iter().filter(|l| l.account_id == *id) {
            let slot = match line.bucket {
                Bucket::Available => &mut available_delta,
                Bucket::Locked => &mut locked_delta,
            };
            *slot = slot
                .checked_add(line.signed())
                .ok_or_else(|| DomainError::invariant("posting overflow"))?;
        }

        account.adjust(Bucket::Available, available_delta)?;
        account.adjust(Bucket::Locked, locked_delta)?;

        match posting.balancing {
            Balancing::ExternalInflow => {
                account.total_deposited_minor = account
                    .total_deposited_minor
                    .saturating_add(available_delta);
            }
            Balancing::ExternalOutflow => {
                account.total_withdrawn_minor = account
                    .total_withdrawn_minor
                    .saturating_add(-available_delta);
            }
            Balancing::Balanced => {}
        }
        account.version += 1;

        let counter_account_id = if ids.len() == 2 {
            ids.iter().copied().find(|other| other != id)
        } else {
            None
        };
        let amount_minor = if available_delta != 0 {
            available_delta.abs()
        } else {
            locked_delta.abs()
        };

        let effect = EntryEffect {
            account_id: *id,
            amount_minor,
            available_delta_minor: available_delta,
            locked_delta_minor: locked_delta,
            available_after_minor: account.available_minor,
            locked_after_minor: account.locked_minor,
            counter_account_id,
        };
        staged.push((account, effect));
    }

    let mut effects = Vec::with_capacity(staged.len());
    for (account, effect) in staged {
        accounts.insert(account.id, account);
        effects.push(effect);
    }
    Ok(effects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountOwner;
    use proptest::prelude::*;
    use wager_core::{Currency, UserId};

    fn funded(available: MinorUnits) -> Account {
        let mut a = Account::open(&AccountOwner::user(UserId::new()), Currency::Fc);
        a.available_minor = available;
        a
    }

    fn posting(lines: Vec<PostingLine>, balancing: Balancing) -> Posting {
        let primary = lines[0].account_id;
        Posting {
            tx_type: TransactionType::Transfer,
            lines,
            balancing,
            primary_account_id: primary,
            reference: None,
            note: None,
            fingerprint: "test".to_string(),
        }
    }

    #[test]
    fn unbalanced_posting_is_rejected() {
        let a = AccountId::new();
        let b = AccountId::new();
        let p = posting(
            vec![
                PostingLine::debit(a, Bucket::Available, 100),
                PostingLine::credit(b, Bucket::Available, 90),
            ],
            Balancing::Balanced,
        );
        match p.validate().unwrap_err() {
            DomainError::InvariantViolation(msg) if msg.contains("debits must equal credits") => {}
            other => panic!("expected invariant violation, got {other:?}"),
        }
    }

    #[test]
    fn failed_apply_leaves_accounts_untouched() {
        let from = funded(50);
        let to = funded(0);
        let mut accounts = BTreeMap::from([(from.id, from.clone()), (to.id, to.clone())]);

        let p = posting(
            vec![
                PostingLine::debit(from.id, Bucket::Available, 80),
                PostingLine::credit(to.id, Bucket::Available, 80),
            ],
            Balancing::Balanced,
        );

        let err = apply_posting(&p, &mut accounts).unwrap_err();
        assert!(matches!(err, DomainError::InsufficientFunds { .. }));
        assert_eq!(accounts[&from.id], from);
        assert_eq!(accounts[&to.id], to);
    }

    #[test]
    fn lock_moves_available_into_locked_and_bumps_version() {
        let acct = funded(1000);
        let id = acct.id;
        let mut accounts = BTreeMap::from([(id, acct)]);

        let p = posting(
            vec![
                PostingLine::debit(id, Bucket::Available, 500),
                PostingLine::credit(id, Bucket::Locked, 500),
            ],
            Balancing::Balanced,
        );
        let effects = apply_posting(&p, &mut accounts).unwrap();

        assert_eq!(effects.len(), 1);
        assert_eq!(effects[0].amount_minor, 500);
        assert_eq!(effects[0].available_after_minor, 500);
        assert_eq!(effects[0].locked_after_minor, 500);
        assert_eq!(effects[0].counter_account_id, None);
        assert_eq!(accounts[&id].version, 1);
    }

    #[test]
    fn inflow_must_only_credit_available() {
        let id = AccountId::new();
        let p = posting(
            vec![PostingLine::credit(id, Bucket::Locked, 10)],
            Balancing::ExternalInflow,
        );
        assert!(p.validate().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: applying any sequence of balanced transfers never changes
        /// the total held across accounts and never drives a bucket negative.
        #[test]
        fn balanced_postings_conserve_total(
            moves in prop::collection::vec((0usize..3, 0usize..3, 1i64..5_000i64), 1..40)
        ) {
            let seed = [funded(10_000), funded(10_000), funded(10_000)];
            let ids: Vec<AccountId> = seed.iter().map(|a| a.id).collect();
            let mut accounts: BTreeMap<AccountId, Account> =
                seed.into_iter().map(|a| (a.id, a)).collect();
            let total_before: i128 = accounts.values().map(|a| i128::from(a.total_minor())).sum();

            for (from, to, amount) in moves {
                if from == to {
                    continue;
                }
                let p = posting(
                    vec![
                        PostingLine::debit(ids[from], Bucket::Available, amount),
                        PostingLine::credit(ids[to], Bucket::Available, amount),
                    ],
                    Balancing::Balanced,
                );
                // Insufficient funds is fine; it must just leave no trace.
                let _ = apply_posting(&p, &mut accounts);
            }

            let total_after: i128 = accounts.values().map(|a| i128::from(a.total_minor())).sum();
            prop_assert_eq!(total_before, total_after);
            for a in accounts.values() {
                prop_assert!(a.available_minor >= 0);
                prop_assert!(a.locked_minor >= 0);
            }
        }
    }
}

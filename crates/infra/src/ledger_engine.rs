//! Idempotent money operations over an `AccountStore`.
//!
//! Every operation runs `claim check -> load -> plan -> apply -> commit`. The
//! commit carries the versions the plan was built against; a concurrent writer
//! makes it fail with `Concurrency`, and the whole cycle is retried with
//! exponential backoff up to `max_attempts` times.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use wager_core::{
    AccountId, Currency, DomainError, FeeBps, MatchId, MinorUnits, OperationId, TransactionId,
    UserId,
};
use wager_ledger::planner::{
    plan_deposit, plan_earn, plan_lock, plan_payout, plan_refund, plan_transfer, plan_unlock,
    plan_withdraw,
};
use wager_ledger::{
    Account, AccountOwner, EscrowPosition, HOUSE_OPERATIONS, HOUSE_REWARDS, LedgerRequest,
    OperationRecord, Posting, Reference, Transaction, TransactionState, TransactionType,
    apply_posting,
};

use crate::account_store::{
    AccountStore, AccountStoreError, CommitOutcome, HistoryPage, HistoryQuery, LedgerCommit,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub currency: Currency,
    pub fee_bps: FeeBps,
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            currency: Currency::Fc,
            fee_bps: FeeBps::DEFAULT,
            max_attempts: 5,
            base_backoff: Duration::from_millis(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Storage is unreachable or returned data the engine cannot trust.
    #[error("ledger unavailable: {0}")]
    Fatal(String),
}

impl From<AccountStoreError> for LedgerError {
    fn from(err: AccountStoreError) -> Self {
        match err {
            AccountStoreError::Concurrency(msg) => LedgerError::Domain(DomainError::conflict(msg)),
            AccountStoreError::NotFound(msg) => LedgerError::Domain(DomainError::not_found(msg)),
            AccountStoreError::Invalid(msg) | AccountStoreError::Unavailable(msg) => {
                LedgerError::Fatal(msg)
            }
        }
    }
}

/// Result of a ledger operation (fresh or replayed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerReceipt {
    pub operation_id: OperationId,
    pub tx_type: TransactionType,
    /// Row of the operation's primary account.
    pub transaction: Transaction,
    pub transactions: Vec<Transaction>,
    /// The idempotency key had already been processed; nothing new was written.
    pub replayed: bool,
}

impl LedgerReceipt {
    fn from_record(record: OperationRecord, replayed: bool) -> Result<Self, LedgerError> {
        let transaction = record
            .primary()
            .cloned()
            .ok_or_else(|| LedgerError::Fatal(format!("operation {} has no rows", record.operation_id)))?;
        Ok(Self {
            operation_id: record.operation_id,
            tx_type: record.tx_type,
            transaction,
            transactions: record.transactions,
            replayed,
        })
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction.id
    }

    pub fn new_available_minor(&self) -> MinorUnits {
        self.transaction.balance_after_minor
    }

    pub fn new_locked_minor(&self) -> MinorUnits {
        self.transaction.locked_after_minor
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub user_id: UserId,
    pub currency: Currency,
    pub decimals: u8,
    pub available_minor: MinorUnits,
    pub locked_minor: MinorUnits,
    pub total_minor: MinorUnits,
    pub total_deposited_minor: MinorUnits,
    pub total_withdrawn_minor: MinorUnits,
}

impl Balance {
    fn of(user_id: UserId, currency: Currency, account: Option<&Account>) -> Self {
        match account {
            Some(a) => Self {
                user_id,
                currency,
                decimals: a.decimals,
                available_minor: a.available_minor,
                locked_minor: a.locked_minor,
                total_minor: a.total_minor(),
                total_deposited_minor: a.total_deposited_minor,
                total_withdrawn_minor: a.total_withdrawn_minor,
            },
            None => Self {
                user_id,
                currency,
                decimals: currency.decimals(),
                available_minor: 0,
                locked_minor: 0,
                total_minor: 0,
                total_deposited_minor: 0,
                total_withdrawn_minor: 0,
            },
        }
    }
}

/// One planning pass: the posting plus the snapshots it was planned against.
struct Planned {
    posting: Posting,
    accounts: BTreeMap<AccountId, Account>,
}

enum Attempt {
    Done(LedgerReceipt),
    /// Lost an optimistic race; plan again from fresh state.
    Retry(String),
}

pub struct LedgerEngine {
    store: Arc<dyn AccountStore>,
    config: LedgerConfig,
}

impl LedgerEngine {
    pub fn new(store: Arc<dyn AccountStore>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    // Match escrow

    pub fn lock_wager(
        &self,
        user_id: UserId,
        match_id: MatchId,
        amount_minor: MinorUnits,
        idempotency_key: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.execute(
            LedgerRequest::Lock {
                user_id,
                amount_minor,
                reference: Reference::for_match(match_id),
            },
            idempotency_key,
        )
    }

    /// Release the user's whole net stake for the match.
    pub fn unlock_wager(
        &self,
        user_id: UserId,
        match_id: MatchId,
        idempotency_key: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.execute(
            LedgerRequest::Unlock {
                user_id,
                amount_minor: None,
                reference: Reference::for_match(match_id),
            },
            idempotency_key,
        )
    }

    pub fn payout_winner(
        &self,
        match_id: MatchId,
        winner_id: UserId,
        idempotency_key: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.execute(
            LedgerRequest::Payout {
                match_id,
                winner_id,
            },
            idempotency_key,
        )
    }

    pub fn refund_match(
        &self,
        match_id: MatchId,
        idempotency_key: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.execute(LedgerRequest::Refund { match_id }, idempotency_key)
    }

    /// Net amount the user currently has locked against the match.
    pub fn escrowed_minor(&self, user_id: UserId, match_id: MatchId) -> Result<MinorUnits, LedgerError> {
        let positions = self.store.escrow_positions(&Reference::for_match(match_id))?;
        Ok(positions
            .iter()
            .filter(|p| p.user_id == Some(user_id))
            .map(|p| p.locked_minor)
            .sum())
    }

    // Generic reference locks (tournament and prop entries)

    pub fn lock(
        &self,
        user_id: UserId,
        amount_minor: MinorUnits,
        reference: Reference,
        idempotency_key: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.execute(
            LedgerRequest::Lock {
                user_id,
                amount_minor,
                reference,
            },
            idempotency_key,
        )
    }

    pub fn unlock(
        &self,
        user_id: UserId,
        amount_minor: Option<MinorUnits>,
        reference: Reference,
        idempotency_key: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.execute(
            LedgerRequest::Unlock {
                user_id,
                amount_minor,
                reference,
            },
            idempotency_key,
        )
    }

    pub fn transfer(
        &self,
        from_user_id: UserId,
        to_user_id: UserId,
        amount_minor: MinorUnits,
        note: Option<String>,
        idempotency_key: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.execute(
            LedgerRequest::Transfer {
                from_user_id,
                to_user_id,
                amount_minor,
                note,
            },
            idempotency_key,
        )
    }

    pub fn earn(
        &self,
        user_id: UserId,
        amount_minor: MinorUnits,
        reason: impl Into<String>,
        reference: Option<Reference>,
        idempotency_key: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.execute(
            LedgerRequest::Earn {
                user_id,
                amount_minor,
                reason: reason.into(),
                reference,
            },
            idempotency_key,
        )
    }

    pub fn deposit(
        &self,
        owner: AccountOwner,
        amount_minor: MinorUnits,
        external_ref: Option<String>,
        idempotency_key: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.execute(
            LedgerRequest::Deposit {
                owner,
                amount_minor,
                external_ref,
            },
            idempotency_key,
        )
    }

    pub fn withdraw(
        &self,
        user_id: UserId,
        amount_minor: MinorUnits,
        external_ref: Option<String>,
        idempotency_key: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.execute(
            LedgerRequest::Withdraw {
                user_id,
                amount_minor,
                external_ref,
            },
            idempotency_key,
        )
    }

    // Reads

    /// A user without an account reads as all zeroes.
    pub fn balance(&self, user_id: UserId) -> Result<Balance, LedgerError> {
        let account = self
            .store
            .find(&AccountOwner::user(user_id), self.config.currency)?;
        Ok(Balance::of(user_id, self.config.currency, account.as_ref()))
    }

    pub fn history(&self, user_id: UserId, query: &HistoryQuery) -> Result<HistoryPage, LedgerError> {
        match self
            .store
            .find(&AccountOwner::user(user_id), self.config.currency)?
        {
            Some(account) => Ok(self.store.history(account.id, query)?),
            None => Ok(HistoryPage::empty()),
        }
    }

    pub fn house_account(&self, label: &str) -> Result<Account, LedgerError> {
        Ok(self
            .store
            .get_or_open(&AccountOwner::house(label), self.config.currency)?)
    }

    /// Run one request exactly once per `(idempotency_key, type)`.
    #[instrument(
        skip(self, request),
        fields(tx_type = request.tx_type().as_str(), idempotency_key = %idempotency_key),
        err
    )]
    pub fn execute(
        &self,
        request: LedgerRequest,
        idempotency_key: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        request.validate()?;
        if idempotency_key.trim().is_empty() {
            return Err(DomainError::validation("idempotency key is required").into());
        }

        let tx_type = request.tx_type();
        let fingerprint = request.fingerprint();
        let max_attempts = self.config.max_attempts.max(1);

        let mut last_conflict = String::new();
        for attempt in 1..=max_attempts {
            match self.attempt(&request, idempotency_key, tx_type, &fingerprint)? {
                Attempt::Done(receipt) => {
                    if !receipt.replayed {
                        info!(
                            operation_id = %receipt.operation_id,
                            rows = receipt.transactions.len(),
                            "ledger operation committed"
                        );
                    }
                    return Ok(receipt);
                }
                Attempt::Retry(reason) => {
                    debug!(attempt, %reason, "ledger commit lost a race, retrying");
                    last_conflict = reason;
                    if attempt < max_attempts {
                        thread::sleep(self.backoff(attempt));
                    }
                }
            }
        }

        warn!(max_attempts, "ledger retries exhausted");
        Err(DomainError::conflict(format!(
            "gave up after {max_attempts} attempts: {last_conflict}"
        ))
        .into())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(10);
        self.config.base_backoff.saturating_mul(factor)
    }

    fn attempt(
        &self,
        request: &LedgerRequest,
        idempotency_key: &str,
        tx_type: TransactionType,
        fingerprint: &str,
    ) -> Result<Attempt, LedgerError> {
        if let Some(existing) = self.store.find_operation(idempotency_key, tx_type)? {
            return replay(existing, fingerprint).map(Attempt::Done);
        }

        let planned = match self.plan(request) {
            Ok(planned) => planned,
            Err(PlanError::Stale(reason)) => return Ok(Attempt::Retry(reason)),
            Err(PlanError::Ledger(err)) => return Err(err),
        };
        let Planned {
            mut posting,
            mut accounts,
        } = planned;
        posting.fingerprint = fingerprint.to_string();

        let mut expected_versions = Vec::new();
        for id in posting.account_ids() {
            let account = accounts
                .get(&id)
                .ok_or_else(|| DomainError::not_found(format!("account {id}")))?;
            expected_versions.push((id, account.version));
        }

        let effects = apply_posting(&posting, &mut accounts)?;

        let now = Utc::now();
        let operation_id = OperationId::new();
        let (ref_type, ref_id) = match &posting.reference {
            Some(r) => (Some(r.ref_type), Some(r.ref_id.clone())),
            None => (None, None),
        };

        let mut updated = Vec::with_capacity(effects.len());
        let mut transactions = Vec::with_capacity(effects.len());
        for effect in effects {
            if let Some(account) = accounts.get(&effect.account_id) {
                updated.push(account.clone());
            }
            transactions.push(Transaction {
                id: TransactionId::new(),
                seq: 0,
                operation_id,
                tx_type,
                state: TransactionState::Completed,
                account_id: effect.account_id,
                amount_minor: effect.amount_minor,
                available_delta_minor: effect.available_delta_minor,
                locked_delta_minor: effect.locked_delta_minor,
                counter_account_id: effect.counter_account_id,
                ref_type,
                ref_id: ref_id.clone(),
                idempotency_key: idempotency_key.to_string(),
                balance_after_minor: effect.available_after_minor,
                locked_after_minor: effect.locked_after_minor,
                note: posting.note.clone(),
                created_at: now,
            });
        }

        let commit = LedgerCommit {
            expected_versions,
            accounts: updated,
            record: OperationRecord {
                operation_id,
                idempotency_key: idempotency_key.to_string(),
                tx_type,
                fingerprint: posting.fingerprint.clone(),
                primary_account_id: posting.primary_account_id,
                transactions,
                created_at: now,
            },
        };

        match self.store.commit(commit) {
            Ok(CommitOutcome::Committed(record)) => {
                LedgerReceipt::from_record(record, false).map(Attempt::Done)
            }
            Ok(CommitOutcome::AlreadyClaimed(record)) => {
                replay(record, fingerprint).map(Attempt::Done)
            }
            Err(AccountStoreError::Concurrency(reason)) => Ok(Attempt::Retry(reason)),
            Err(err) => Err(err.into()),
        }
    }

    fn plan(&self, request: &LedgerRequest) -> Result<Planned, PlanError> {
        let currency = self.config.currency;
        let single = |account: Account, posting: Posting| Planned {
            posting,
            accounts: BTreeMap::from([(account.id, account)]),
        };

        match request {
            LedgerRequest::Lock {
                user_id,
                amount_minor,
                reference,
            } => {
                let account = self.store.get_or_open(&AccountOwner::user(*user_id), currency)?;
                let posting = plan_lock(&account, *amount_minor, reference.clone())?;
                Ok(single(account, posting))
            }
            LedgerRequest::Unlock {
                user_id,
                amount_minor,
                reference,
            } => {
                let account = self.store.get_or_open(&AccountOwner::user(*user_id), currency)?;
                let (positions, accounts) = self.escrow_snapshot(reference, &[account.id])?;
                let position = positions
                    .iter()
                    .find(|p| p.account_id == account.id)
                    .copied()
                    .unwrap_or(EscrowPosition {
                        account_id: account.id,
                        user_id: Some(*user_id),
                        locked_minor: 0,
                    });
                let posting = plan_unlock(&position, *amount_minor, reference.clone())?;
                Ok(Planned { posting, accounts })
            }
            LedgerRequest::Payout {
                match_id,
                winner_id,
            } => {
                let house = self
                    .store
                    .get_or_open(&AccountOwner::house(HOUSE_OPERATIONS), currency)?;
                let reference = Reference::for_match(*match_id);
                let (positions, accounts) = self.escrow_snapshot(&reference, &[house.id])?;
                let posting = plan_payout(
                    *match_id,
                    &positions,
                    *winner_id,
                    house.id,
                    self.config.fee_bps,
                )?;
                Ok(Planned { posting, accounts })
            }
            LedgerRequest::Refund { match_id } => {
                let reference = Reference::for_match(*match_id);
                let (positions, accounts) = self.escrow_snapshot(&reference, &[])?;
                let posting = plan_refund(*match_id, &positions)?;
                Ok(Planned { posting, accounts })
            }
            LedgerRequest::Transfer {
                from_user_id,
                to_user_id,
                amount_minor,
                note,
            } => {
                let from = self
                    .store
                    .get_or_open(&AccountOwner::user(*from_user_id), currency)?;
                let to = self
                    .store
                    .get_or_open(&AccountOwner::user(*to_user_id), currency)?;
                let posting = plan_transfer(&from, &to, *amount_minor, note.clone())?;
                Ok(Planned {
                    posting,
                    accounts: BTreeMap::from([(from.id, from), (to.id, to)]),
                })
            }
            LedgerRequest::Earn {
                user_id,
                amount_minor,
                reason,
                reference,
            } => {
                let user = self.store.get_or_open(&AccountOwner::user(*user_id), currency)?;
                let house = self
                    .store
                    .get_or_open(&AccountOwner::house(HOUSE_REWARDS), currency)?;
                let posting = plan_earn(&user, &house, *amount_minor, reason, reference.clone())?;
                Ok(Planned {
                    posting,
                    accounts: BTreeMap::from([(user.id, user), (house.id, house)]),
                })
            }
            LedgerRequest::Deposit {
                owner,
                amount_minor,
                external_ref,
            } => {
                let account = self.store.get_or_open(owner, currency)?;
                let posting = plan_deposit(&account, *amount_minor, external_ref.clone())?;
                Ok(single(account, posting))
            }
            LedgerRequest::Withdraw {
                user_id,
                amount_minor,
                external_ref,
            } => {
                let account = self.store.get_or_open(&AccountOwner::user(*user_id), currency)?;
                let posting = plan_withdraw(&account, *amount_minor, external_ref.clone())?;
                Ok(single(account, posting))
            }
        }
    }

    /// Escrow positions for a reference plus snapshots of every account
    /// involved, read so that the two agree.
    ///
    /// Positions are read on both sides of the account load. If they moved in
    /// between, the snapshots may predate the change without their versions
    /// showing it, so the attempt is retried.
    fn escrow_snapshot(
        &self,
        reference: &Reference,
        extra: &[AccountId],
    ) -> Result<(Vec<EscrowPosition>, BTreeMap<AccountId, Account>), PlanError> {
        let before = self.store.escrow_positions(reference)?;

        let mut ids: Vec<AccountId> = before.iter().map(|p| p.account_id).collect();
        ids.extend_from_slice(extra);
        ids.sort();
        ids.dedup();
        let accounts = self.store.load(&ids)?;

        let after = self.store.escrow_positions(reference)?;
        if before != after {
            return Err(PlanError::Stale(format!(
                "escrow for {}:{} changed while planning",
                reference.ref_type.as_str(),
                reference.ref_id
            )));
        }
        Ok((before, accounts))
    }
}

enum PlanError {
    Stale(String),
    Ledger(LedgerError),
}

impl From<DomainError> for PlanError {
    fn from(err: DomainError) -> Self {
        PlanError::Ledger(err.into())
    }
}

impl From<AccountStoreError> for PlanError {
    fn from(err: AccountStoreError) -> Self {
        PlanError::Ledger(err.into())
    }
}

fn replay(record: OperationRecord, fingerprint: &str) -> Result<LedgerReceipt, LedgerError> {
    if record.fingerprint != fingerprint {
        return Err(DomainError::conflict(format!(
            "idempotency key '{}' was already used for a different {} request",
            record.idempotency_key,
            record.tx_type.as_str()
        ))
        .into());
    }
    debug!(operation_id = %record.operation_id, "replaying processed operation");
    LedgerReceipt::from_record(record, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account_store::InMemoryAccountStore;
    use proptest::prelude::*;
    use wager_ledger::RefType;

    fn engine() -> LedgerEngine {
        LedgerEngine::new(Arc::new(InMemoryAccountStore::new()), LedgerConfig::default())
    }

    fn funded(engine: &LedgerEngine, amount: MinorUnits) -> UserId {
        let user = UserId::new();
        engine
            .deposit(AccountOwner::user(user), amount, None, &format!("fund-{user}"))
            .unwrap();
        user
    }

    fn total_in_ledger(engine: &LedgerEngine) -> MinorUnits {
        engine
            .store()
            .accounts(Currency::Fc)
            .unwrap()
            .iter()
            .map(Account::total_minor)
            .sum()
    }

    #[test]
    fn lock_moves_available_to_locked() {
        let engine = engine();
        let user = funded(&engine, 1_000);
        let match_id = MatchId::new();

        let receipt = engine.lock_wager(user, match_id, 400, "m1:lock").unwrap();
        assert!(!receipt.replayed);
        assert_eq!(receipt.new_available_minor(), 600);
        assert_eq!(receipt.new_locked_minor(), 400);
        assert_eq!(receipt.transaction.ref_type, Some(RefType::Match));
        assert_eq!(receipt.transaction.ref_id, Some(match_id.to_string()));
    }

    #[test]
    fn lock_beyond_available_is_insufficient_funds() {
        let engine = engine();
        let user = funded(&engine, 100);
        let err = engine
            .lock_wager(user, MatchId::new(), 101, "k")
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Domain(DomainError::InsufficientFunds {
                available: 100,
                requested: 101
            })
        ));
        assert_eq!(engine.balance(user).unwrap().available_minor, 100);
    }

    #[test]
    fn retried_key_replays_the_original_transaction() {
        let engine = engine();
        let user = funded(&engine, 1_000);
        let match_id = MatchId::new();

        let first = engine.lock_wager(user, match_id, 500, "k1").unwrap();
        let second = engine.lock_wager(user, match_id, 500, "k1").unwrap();
        assert!(second.replayed);
        assert_eq!(first.transaction_id(), second.transaction_id());

        let balance = engine.balance(user).unwrap();
        assert_eq!(balance.available_minor, 500);
        assert_eq!(balance.locked_minor, 500);
    }

    #[test]
    fn reused_key_with_different_parameters_conflicts() {
        let engine = engine();
        let user = funded(&engine, 1_000);
        let match_id = MatchId::new();

        engine.lock_wager(user, match_id, 500, "k1").unwrap();
        let err = engine.lock_wager(user, match_id, 300, "k1").unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::Conflict(_))));
    }

    #[test]
    fn same_key_under_a_different_type_is_a_separate_claim() {
        let engine = engine();
        let user = funded(&engine, 1_000);
        let match_id = MatchId::new();

        engine.lock_wager(user, match_id, 500, "shared").unwrap();
        let unlock = engine.unlock_wager(user, match_id, "shared").unwrap();
        assert!(!unlock.replayed);
        assert_eq!(unlock.transaction.amount_minor, 500);
    }

    #[test]
    fn payout_pays_pot_minus_fee_and_credits_house() {
        let engine = engine();
        let a = funded(&engine, 1_000);
        let b = funded(&engine, 1_000);
        let match_id = MatchId::new();
        engine.lock_wager(a, match_id, 500, "a-lock").unwrap();
        engine.lock_wager(b, match_id, 500, "b-lock").unwrap();

        let receipt = engine.payout_winner(match_id, a, "pay").unwrap();
        assert_eq!(receipt.transactions.len(), 3);

        let winner = engine.balance(a).unwrap();
        assert_eq!(winner.available_minor, 1_450);
        assert_eq!(winner.locked_minor, 0);

        let loser = engine.balance(b).unwrap();
        assert_eq!(loser.available_minor, 500);
        assert_eq!(loser.locked_minor, 0);

        let house = engine.house_account(HOUSE_OPERATIONS).unwrap();
        assert_eq!(house.available_minor, 50);
        assert_eq!(total_in_ledger(&engine), 2_000);
    }

    #[test]
    fn refund_after_payout_finds_no_escrow() {
        let engine = engine();
        let a = funded(&engine, 1_000);
        let b = funded(&engine, 1_000);
        let match_id = MatchId::new();
        engine.lock_wager(a, match_id, 500, "a-lock").unwrap();
        engine.lock_wager(b, match_id, 500, "b-lock").unwrap();
        engine.payout_winner(match_id, b, "pay").unwrap();

        let err = engine.refund_match(match_id, "refund").unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::NotFound(_))));
    }

    #[test]
    fn escrowed_amount_follows_lock_and_unlock() {
        let engine = engine();
        let a = funded(&engine, 1_000);
        let b = funded(&engine, 1_000);
        let match_id = MatchId::new();
        engine.lock_wager(a, match_id, 500, "a-lock").unwrap();
        assert_eq!(engine.escrowed_minor(a, match_id).unwrap(), 500);
        assert_eq!(engine.escrowed_minor(b, match_id).unwrap(), 0);

        engine.unlock_wager(a, match_id, "a-unlock").unwrap();
        assert_eq!(engine.escrowed_minor(a, match_id).unwrap(), 0);
        // A replayed lock does not lock again.
        engine.lock_wager(a, match_id, 500, "a-lock").unwrap();
        assert_eq!(engine.escrowed_minor(a, match_id).unwrap(), 0);
    }

    #[test]
    fn refund_returns_every_stake() {
        let engine = engine();
        let a = funded(&engine, 1_000);
        let b = funded(&engine, 700);
        let match_id = MatchId::new();
        engine.lock_wager(a, match_id, 500, "a-lock").unwrap();
        engine.lock_wager(b, match_id, 500, "b-lock").unwrap();

        engine.refund_match(match_id, "refund").unwrap();
        assert_eq!(engine.balance(a).unwrap().available_minor, 1_000);
        assert_eq!(engine.balance(b).unwrap().available_minor, 700);
        assert_eq!(engine.balance(b).unwrap().locked_minor, 0);
    }

    #[test]
    fn payout_to_a_non_player_is_rejected() {
        let engine = engine();
        let a = funded(&engine, 1_000);
        let match_id = MatchId::new();
        engine.lock_wager(a, match_id, 500, "a-lock").unwrap();

        let err = engine
            .payout_winner(match_id, UserId::new(), "pay")
            .unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::Validation(_))));
        assert_eq!(engine.balance(a).unwrap().locked_minor, 500);
    }

    #[test]
    fn unlock_cannot_release_more_than_is_locked_for_the_reference() {
        let engine = engine();
        let user = funded(&engine, 1_000);
        let tournament = Reference::new(RefType::Tournament, "t-1");
        engine.lock(user, 300, tournament.clone(), "enter").unwrap();
        engine
            .lock_wager(user, MatchId::new(), 200, "other")
            .unwrap();

        let err = engine
            .unlock(user, Some(400), tournament.clone(), "leave")
            .unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::Validation(_))));

        engine.unlock(user, Some(100), tournament, "partial").unwrap();
        let balance = engine.balance(user).unwrap();
        assert_eq!(balance.available_minor, 600);
        assert_eq!(balance.locked_minor, 400);
    }

    #[test]
    fn earn_requires_a_funded_rewards_house() {
        let engine = engine();
        let user = UserId::new();
        let err = engine.earn(user, 100, "daily-login", None, "e1").unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Domain(DomainError::InsufficientFunds { .. })
        ));

        engine
            .deposit(AccountOwner::house(HOUSE_REWARDS), 1_000, None, "seed")
            .unwrap();
        let receipt = engine.earn(user, 100, "daily-login", None, "e2").unwrap();
        assert_eq!(receipt.transaction.note.as_deref(), Some("daily-login"));
        assert_eq!(engine.balance(user).unwrap().available_minor, 100);
        assert_eq!(engine.house_account(HOUSE_REWARDS).unwrap().available_minor, 900);
    }

    #[test]
    fn transfer_moves_available_between_users() {
        let engine = engine();
        let from = funded(&engine, 300);
        let to = UserId::new();

        let receipt = engine
            .transfer(from, to, 120, Some("gg".to_string()), "t1")
            .unwrap();
        assert_eq!(receipt.transaction.balance_after_minor, 180);
        assert!(receipt.transaction.counter_account_id.is_some());
        assert_eq!(engine.balance(to).unwrap().available_minor, 120);

        let err = engine.transfer(from, to, 1_000, None, "t2").unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Domain(DomainError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn withdraw_tracks_totals() {
        let engine = engine();
        let user = funded(&engine, 500);
        engine.withdraw(user, 200, Some("payout-1".into()), "w1").unwrap();

        let balance = engine.balance(user).unwrap();
        assert_eq!(balance.available_minor, 300);
        assert_eq!(balance.total_deposited_minor, 500);
        assert_eq!(balance.total_withdrawn_minor, 200);
    }

    #[test]
    fn unknown_user_reads_as_zero_with_empty_history() {
        let engine = engine();
        let user = UserId::new();
        let balance = engine.balance(user).unwrap();
        assert_eq!(balance.total_minor, 0);
        assert_eq!(balance.decimals, 2);
        let page = engine.history(user, &HistoryQuery::new(None, None)).unwrap();
        assert!(page.items.is_empty());
        assert!(!page.has_more);
    }

    #[test]
    fn history_filters_by_type() {
        let engine = engine();
        let user = funded(&engine, 1_000);
        engine.lock_wager(user, MatchId::new(), 100, "l1").unwrap();
        engine.lock_wager(user, MatchId::new(), 100, "l2").unwrap();

        let locks = engine
            .history(
                user,
                &HistoryQuery::new(None, None).with_type(Some(TransactionType::Lock)),
            )
            .unwrap();
        assert_eq!(locks.items.len(), 2);
        assert!(locks.items.iter().all(|t| t.tx_type == TransactionType::Lock));
    }

    #[test]
    fn concurrent_locks_never_overdraw() {
        let engine = Arc::new(LedgerEngine::new(
            Arc::new(InMemoryAccountStore::new()),
            LedgerConfig {
                max_attempts: 64,
                base_backoff: Duration::from_micros(50),
                ..LedgerConfig::default()
            },
        ));
        let user = funded(&engine, 1_000);

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || engine.lock_wager(user, MatchId::new(), 200, &format!("c{i}")))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 5);
        assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
            e,
            LedgerError::Domain(DomainError::InsufficientFunds { .. })
        )));

        let balance = engine.balance(user).unwrap();
        assert_eq!(balance.available_minor, 0);
        assert_eq!(balance.locked_minor, 1_000);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Lock(usize, MinorUnits),
        Transfer(usize, usize, MinorUnits),
        Settle(bool),
        Withdraw(usize, MinorUnits),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize, 1..400i64).prop_map(|(u, a)| Op::Lock(u, a)),
            (0..3usize, 0..3usize, 1..400i64).prop_map(|(f, t, a)| Op::Transfer(f, t, a)),
            any::<bool>().prop_map(Op::Settle),
            (0..3usize, 1..200i64).prop_map(|(u, a)| Op::Withdraw(u, a)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn total_money_only_changes_through_deposit_and_withdraw(ops in prop::collection::vec(op(), 1..24)) {
            let engine = engine();
            let users: Vec<UserId> = (0..3).map(|_| funded(&engine, 1_000)).collect();
            let mut match_id = MatchId::new();
            let mut withdrawn: MinorUnits = 0;

            for (i, op) in ops.into_iter().enumerate() {
                let key = format!("op-{i}");
                match op {
                    Op::Lock(u, amount) => {
                        let _ = engine.lock_wager(users[u], match_id, amount, &key);
                    }
                    Op::Transfer(f, t, amount) => {
                        let _ = engine.transfer(users[f], users[t], amount, None, &key);
                    }
                    Op::Settle(pay) => {
                        let _ = if pay {
                            engine.payout_winner(match_id, users[0], &key)
                        } else {
                            engine.refund_match(match_id, &key)
                        };
                        match_id = MatchId::new();
                    }
                    Op::Withdraw(u, amount) => {
                        if engine.withdraw(users[u], amount, None, &key).is_ok() {
                            withdrawn += amount;
                        }
                    }
                }

                prop_assert_eq!(total_in_ledger(&engine), 3_000 - withdrawn);
                for account in engine.store().accounts(Currency::Fc).unwrap() {
                    prop_assert!(account.available_minor >= 0);
                    prop_assert!(account.locked_minor >= 0);
                }
            }
        }
    }
}

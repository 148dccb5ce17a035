use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use wager_core::{AccountId, Currency, MinorUnits};
use wager_ledger::{
    Account, AccountOwner, EscrowPosition, OperationRecord, Reference, Transaction,
    TransactionType,
};

use super::r#trait::{
    AccountStore, AccountStoreError, CommitOutcome, HistoryPage, HistoryQuery, LedgerCommit,
};

#[derive(Debug, Default)]
struct State {
    accounts: BTreeMap<AccountId, Account>,
    by_owner: HashMap<(AccountOwner, Currency), AccountId>,
    operations: HashMap<(String, TransactionType), OperationRecord>,
    /// Append-only, ascending `seq`.
    transactions: Vec<Transaction>,
    next_seq: u64,
}

/// In-memory account store.
///
/// Intended for tests/dev and single-instance deployments. One mutex guards
/// the whole ledger, so a commit is trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    state: Mutex<State>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, AccountStoreError> {
        self.state
            .lock()
            .map_err(|_| AccountStoreError::Unavailable("lock poisoned".to_string()))
    }
}

impl AccountStore for InMemoryAccountStore {
    fn get_or_open(
        &self,
        owner: &AccountOwner,
        currency: Currency,
    ) -> Result<Account, AccountStoreError> {
        let mut state = self.lock()?;
        let key = (owner.clone(), currency);
        if let Some(id) = state.by_owner.get(&key) {
            if let Some(existing) = state.accounts.get(id) {
                return Ok(existing.clone());
            }
        }
        let account = Account::open(owner, currency);
        state.by_owner.insert(key, account.id);
        state.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    fn find(
        &self,
        owner: &AccountOwner,
        currency: Currency,
    ) -> Result<Option<Account>, AccountStoreError> {
        let state = self.lock()?;
        Ok(state
            .by_owner
            .get(&(owner.clone(), currency))
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    fn load(&self, ids: &[AccountId]) -> Result<BTreeMap<AccountId, Account>, AccountStoreError> {
        let state = self.lock()?;
        ids.iter()
            .map(|id| {
                state
                    .accounts
                    .get(id)
                    .cloned()
                    .map(|a| (*id, a))
                    .ok_or_else(|| AccountStoreError::NotFound(format!("account {id}")))
            })
            .collect()
    }

    fn find_operation(
        &self,
        idempotency_key: &str,
        tx_type: TransactionType,
    ) -> Result<Option<OperationRecord>, AccountStoreError> {
        let state = self.lock()?;
        Ok(state
            .operations
            .get(&(idempotency_key.to_string(), tx_type))
            .cloned())
    }

    fn escrow_positions(
        &self,
        reference: &Reference,
    ) -> Result<Vec<EscrowPosition>, AccountStoreError> {
        let state = self.lock()?;
        let mut net: BTreeMap<AccountId, MinorUnits> = BTreeMap::new();
        for tx in state
            .transactions
            .iter()
            .filter(|t| t.ref_type == Some(reference.ref_type))
            .filter(|t| t.ref_id.as_deref() == Some(reference.ref_id.as_str()))
        {
            *net.entry(tx.account_id).or_default() += tx.locked_delta_minor;
        }

        Ok(net
            .into_iter()
            .filter(|(_, locked)| *locked > 0)
            .map(|(account_id, locked_minor)| EscrowPosition {
                account_id,
                user_id: state.accounts.get(&account_id).and_then(|a| a.user_id),
                locked_minor,
            })
            .collect())
    }

    fn commit(&self, commit: LedgerCommit) -> Result<CommitOutcome, AccountStoreError> {
        let mut state = self.lock()?;

        let claim = (
            commit.record.idempotency_key.clone(),
            commit.record.tx_type,
        );
        if let Some(existing) = state.operations.get(&claim) {
            return Ok(CommitOutcome::AlreadyClaimed(existing.clone()));
        }

        // Check every expected version before touching anything.
        for (id, expected) in &commit.expected_versions {
            let current = state
                .accounts
                .get(id)
                .ok_or_else(|| AccountStoreError::NotFound(format!("account {id}")))?;
            if current.version != *expected {
                return Err(AccountStoreError::Concurrency(format!(
                    "account {id}: expected version {expected}, found {}",
                    current.version
                )));
            }
        }
        for account in &commit.accounts {
            if account.available_minor < 0 || account.locked_minor < 0 {
                return Err(AccountStoreError::Invalid(format!(
                    "account {} would hold a negative balance",
                    account.id
                )));
            }
        }

        for account in commit.accounts {
            state.accounts.insert(account.id, account);
        }

        let mut record = commit.record;
        for tx in &mut record.transactions {
            state.next_seq += 1;
            tx.seq = state.next_seq;
            state.transactions.push(tx.clone());
        }
        state.operations.insert(claim, record.clone());

        Ok(CommitOutcome::Committed(record))
    }

    fn history(
        &self,
        account_id: AccountId,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, AccountStoreError> {
        let state = self.lock()?;
        let rows: Vec<Transaction> = state
            .transactions
            .iter()
            .rev()
            .filter(|t| t.account_id == account_id && query.matches(t))
            .take(query.limit + 1)
            .cloned()
            .collect();
        Ok(HistoryPage::from_rows(rows, query.limit))
    }

    fn accounts(&self, currency: Currency) -> Result<Vec<Account>, AccountStoreError> {
        let state = self.lock()?;
        Ok(state
            .accounts
            .values()
            .filter(|a| a.currency == currency)
            .cloned()
            .collect())
    }
}

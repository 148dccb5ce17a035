use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use wager_core::{AccountId, Currency};
use wager_ledger::{
    Account, AccountOwner, EscrowPosition, OperationRecord, Reference, Transaction,
    TransactionState, TransactionType,
};

/// Account store operation error.
///
/// Infrastructure errors only; business failures (insufficient funds and the
/// like) are decided by the planner before anything reaches the store.
#[derive(Debug, Error)]
pub enum AccountStoreError {
    /// An account moved past the version the commit was planned against.
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Stored data could not be decoded or violated a constraint.
    #[error("invalid data: {0}")]
    Invalid(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub const DEFAULT_HISTORY_LIMIT: usize = 20;
pub const MAX_HISTORY_LIMIT: usize = 100;

/// Cursor query over one account's transaction rows, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Return rows strictly older than this `seq`.
    pub cursor: Option<u64>,
    pub limit: usize,
    pub tx_type: Option<TransactionType>,
    pub state: Option<TransactionState>,
}

impl HistoryQuery {
    /// `limit` is clamped to 1..=100 and defaults to 20.
    pub fn new(cursor: Option<u64>, limit: Option<usize>) -> Self {
        Self {
            cursor,
            limit: limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT),
            tx_type: None,
            state: None,
        }
    }

    pub fn with_type(mut self, tx_type: Option<TransactionType>) -> Self {
        self.tx_type = tx_type;
        self
    }

    pub fn with_state(mut self, state: Option<TransactionState>) -> Self {
        self.state = state;
        self
    }

    pub fn matches(&self, tx: &Transaction) -> bool {
        self.cursor.is_none_or(|c| tx.seq < c)
            && self.tx_type.is_none_or(|t| tx.tx_type == t)
            && self.state.is_none_or(|s| tx.state == s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    pub items: Vec<Transaction>,
    pub next_cursor: Option<u64>,
    pub has_more: bool,
}

impl HistoryPage {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
            has_more: false,
        }
    }

    /// Build a page from up to `limit + 1` rows fetched newest first.
    pub fn from_rows(mut rows: Vec<Transaction>, limit: usize) -> Self {
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = if has_more { rows.last().map(|t| t.seq) } else { None };
        Self {
            items: rows,
            next_cursor,
            has_more,
        }
    }
}

/// Everything one ledger operation writes, committed atomically.
#[derive(Debug, Clone)]
pub struct LedgerCommit {
    /// Versions the posting was planned against, per touched account.
    pub expected_versions: Vec<(AccountId, u64)>,
    /// Post-state of every touched account (versions already bumped).
    pub accounts: Vec<Account>,
    /// Idempotency claim plus the rows to append (`seq` assigned by the store).
    pub record: OperationRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(OperationRecord),
    /// The `(key, type)` claim already existed; nothing was written.
    AlreadyClaimed(OperationRecord),
}

/// Durable ledger of typed balances.
///
/// Implementations must:
/// - keep `available >= 0` and `locked >= 0` for every account
/// - commit the claim, the rows and every account update atomically
/// - reject a commit when any account is no longer at its expected version
/// - assign strictly increasing `seq` numbers to appended rows
pub trait AccountStore: Send + Sync {
    /// Fetch the account for `owner`, creating a zero-balance one on first touch.
    fn get_or_open(
        &self,
        owner: &AccountOwner,
        currency: Currency,
    ) -> Result<Account, AccountStoreError>;

    fn find(
        &self,
        owner: &AccountOwner,
        currency: Currency,
    ) -> Result<Option<Account>, AccountStoreError>;

    /// Current snapshots of the given accounts. Missing ids are `NotFound`.
    fn load(&self, ids: &[AccountId]) -> Result<BTreeMap<AccountId, Account>, AccountStoreError>;

    fn find_operation(
        &self,
        idempotency_key: &str,
        tx_type: TransactionType,
    ) -> Result<Option<OperationRecord>, AccountStoreError>;

    /// Net locked amount per account for a reference (only accounts with a
    /// positive net are returned), ascending by account id.
    fn escrow_positions(
        &self,
        reference: &Reference,
    ) -> Result<Vec<EscrowPosition>, AccountStoreError>;

    fn commit(&self, commit: LedgerCommit) -> Result<CommitOutcome, AccountStoreError>;

    fn history(
        &self,
        account_id: AccountId,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, AccountStoreError>;

    /// Every account holding `currency` (conservation checks, admin views).
    fn accounts(&self, currency: Currency) -> Result<Vec<Account>, AccountStoreError>;
}

impl<S> AccountStore for Arc<S>
where
    S: AccountStore + ?Sized,
{
    fn get_or_open(
        &self,
        owner: &AccountOwner,
        currency: Currency,
    ) -> Result<Account, AccountStoreError> {
        (**self).get_or_open(owner, currency)
    }

    fn find(
        &self,
        owner: &AccountOwner,
        currency: Currency,
    ) -> Result<Option<Account>, AccountStoreError> {
        (**self).find(owner, currency)
    }

    fn load(&self, ids: &[AccountId]) -> Result<BTreeMap<AccountId, Account>, AccountStoreError> {
        (**self).load(ids)
    }

    fn find_operation(
        &self,
        idempotency_key: &str,
        tx_type: TransactionType,
    ) -> Result<Option<OperationRecord>, AccountStoreError> {
        (**self).find_operation(idempotency_key, tx_type)
    }

    fn escrow_positions(
        &self,
        reference: &Reference,
    ) -> Result<Vec<EscrowPosition>, AccountStoreError> {
        (**self).escrow_positions(reference)
    }

    fn commit(&self, commit: LedgerCommit) -> Result<CommitOutcome, AccountStoreError> {
        (**self).commit(commit)
    }

    fn history(
        &self,
        account_id: AccountId,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, AccountStoreError> {
        (**self).history(account_id, query)
    }

    fn accounts(&self, currency: Currency) -> Result<Vec<Account>, AccountStoreError> {
        (**self).accounts(currency)
    }
}

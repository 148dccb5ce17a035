//! Account store boundary.
//!
//! Balances, the idempotency claims and the immutable transaction rows live
//! behind one trait so the ledger engine can run against memory in tests and
//! Postgres in production without changing a line.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryAccountStore;
pub use postgres::PostgresAccountStore;
pub use r#trait::{
    AccountStore, AccountStoreError, CommitOutcome, DEFAULT_HISTORY_LIMIT, HistoryPage,
    HistoryQuery, LedgerCommit, MAX_HISTORY_LIMIT,
};

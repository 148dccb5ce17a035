//! Wager ledger domain (double-entry postings over available/locked buckets).
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns. The
//! planner turns a request plus account snapshots into a validated `Posting`;
//! stores apply postings atomically.

pub mod account;
pub mod planner;
pub mod posting;
pub mod request;
pub mod transaction;

pub use account::{Account, AccountOwner, AccountType, Bucket, HOUSE_OPERATIONS, HOUSE_REWARDS};
pub use planner::EscrowPosition;
pub use request::LedgerRequest;
pub use posting::{Balancing, EntryEffect, Posting, PostingLine, apply_posting};
pub use transaction::{
    OperationRecord, RefType, Reference, Transaction, TransactionState, TransactionType,
};

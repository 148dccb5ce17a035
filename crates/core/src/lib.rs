//! `wager-core` — shared domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! strongly-typed identifiers, the domain error model, minor-unit money and
//! fee arithmetic, and the optimistic concurrency expectation used by stores.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod money;

pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AccountId, MatchId, OperationId, TicketId, TransactionId, UserId};
pub use money::{Currency, FeeBps, MinorUnits};

//! Durable match records.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryMatchStore;
pub use postgres::PostgresMatchStore;
pub use r#trait::{MatchStore, MatchStoreError};

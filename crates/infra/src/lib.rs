//! Infrastructure layer: stores, the ledger engine, the matchmaking queue and
//! the coordinator that joins them, plus config and background workers.
//!
//! Every store has an in-memory implementation for tests and dev, and a
//! persistent one (Postgres via sqlx for money and matches, Redis behind the
//! `redis` feature for lanes, locks and pub/sub).

pub mod account_store;
pub mod blocking;
pub mod config;
pub mod coordinator;
pub mod event_bus;
pub mod lane_store;
pub mod ledger_engine;
pub mod match_lock;
pub mod match_store;
pub mod matchmaker;
pub mod schema;
pub mod workers;

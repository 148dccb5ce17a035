use std::sync::Arc;

use thiserror::Error;

use wager_core::{ExpectedVersion, MatchId};
use wager_matchmaking::{Match, MatchStatus};

#[derive(Debug, Error)]
pub enum MatchStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid data: {0}")]
    Invalid(String),

    #[error("match store unavailable: {0}")]
    Unavailable(String),
}

/// Versioned match records.
///
/// `update` is a compare-and-set on `version`: the stored record gets
/// `expected + 1`, and a writer holding a stale copy gets `Concurrency`.
pub trait MatchStore: Send + Sync {
    /// Store a freshly formed match. `false` if the id already exists.
    fn insert(&self, record: &Match) -> Result<bool, MatchStoreError>;

    fn get(&self, match_id: MatchId) -> Result<Option<Match>, MatchStoreError>;

    /// Returns the stored record with its bumped version.
    fn update(&self, record: &Match, expected: ExpectedVersion) -> Result<Match, MatchStoreError>;

    /// Oldest-updated first.
    fn list_by_status(&self, status: MatchStatus, limit: usize) -> Result<Vec<Match>, MatchStoreError>;
}

impl<S> MatchStore for Arc<S>
where
    S: MatchStore + ?Sized,
{
    fn insert(&self, record: &Match) -> Result<bool, MatchStoreError> {
        (**self).insert(record)
    }

    fn get(&self, match_id: MatchId) -> Result<Option<Match>, MatchStoreError> {
        (**self).get(match_id)
    }

    fn update(&self, record: &Match, expected: ExpectedVersion) -> Result<Match, MatchStoreError> {
        (**self).update(record, expected)
    }

    fn list_by_status(&self, status: MatchStatus, limit: usize) -> Result<Vec<Match>, MatchStoreError> {
        (**self).list_by_status(status, limit)
    }
}

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use wager_core::MatchId;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend unavailable: {0}")]
    Unavailable(String),
}

/// Proof of holding a lease; release only succeeds with the same token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub token: String,
}

/// Lease lock keyed by match id (`mm:lock:match:{matchId}`).
///
/// A lease expires on its own, so a crashed holder never blocks a pair for
/// longer than `lease`.
pub trait MatchLock: Send + Sync {
    /// `None` when someone else holds an unexpired lease.
    fn acquire(&self, match_id: MatchId, lease: Duration) -> Result<Option<LockToken>, LockError>;

    /// Compare-and-delete; `false` if the lease expired or changed hands.
    fn release(&self, token: &LockToken) -> Result<bool, LockError>;
}

impl<S> MatchLock for Arc<S>
where
    S: MatchLock + ?Sized,
{
    fn acquire(&self, match_id: MatchId, lease: Duration) -> Result<Option<LockToken>, LockError> {
        (**self).acquire(match_id, lease)
    }

    fn release(&self, token: &LockToken) -> Result<bool, LockError> {
        (**self).release(token)
    }
}

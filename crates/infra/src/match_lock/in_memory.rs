use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use wager_core::MatchId;
use wager_matchmaking::keys::match_lock_key;

use super::r#trait::{LockError, LockToken, MatchLock};

/// Process-local lease table.
#[derive(Debug, Default)]
pub struct InMemoryMatchLock {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryMatchLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MatchLock for InMemoryMatchLock {
    fn acquire(&self, match_id: MatchId, lease: Duration) -> Result<Option<LockToken>, LockError> {
        let key = match_lock_key(match_id);
        let now = Instant::now();
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| LockError::Unavailable("lock poisoned".to_string()))?;

        if let Some((_, expires_at)) = leases.get(&key) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::now_v7().to_string();
        leases.insert(key.clone(), (token.clone(), now + lease));
        Ok(Some(LockToken { key, token }))
    }

    fn release(&self, token: &LockToken) -> Result<bool, LockError> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| LockError::Unavailable("lock poisoned".to_string()))?;
        match leases.get(&token.key) {
            Some((held, _)) if *held == token.token => {
                leases.remove(&token.key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

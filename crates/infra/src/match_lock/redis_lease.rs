use std::time::Duration;

use redis::Script;
use uuid::Uuid;

use wager_core::MatchId;
use wager_matchmaking::keys::match_lock_key;

use super::r#trait::{LockError, LockToken, MatchLock};

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// `SET key token NX PX lease` to acquire, compare-and-delete to release.
#[derive(Debug, Clone)]
pub struct RedisMatchLock {
    client: redis::Client,
}

impl RedisMatchLock {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockError::Unavailable(e.to_string()))?;
        Ok(Self { client })
    }

    fn conn(&self) -> Result<redis::Connection, LockError> {
        self.client
            .get_connection()
            .map_err(|e| LockError::Unavailable(e.to_string()))
    }
}

impl MatchLock for RedisMatchLock {
    fn acquire(&self, match_id: MatchId, lease: Duration) -> Result<Option<LockToken>, LockError> {
        let key = match_lock_key(match_id);
        let token = Uuid::now_v7().to_string();
        let lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX).max(1);

        let mut conn = self.conn()?;
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query(&mut conn)
            .map_err(|e| LockError::Unavailable(e.to_string()))?;

        Ok(set.map(|_| LockToken { key, token }))
    }

    fn release(&self, token: &LockToken) -> Result<bool, LockError> {
        let mut conn = self.conn()?;
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(&token.key)
            .arg(&token.token)
            .invoke(&mut conn)
            .map_err(|e| LockError::Unavailable(e.to_string()))?;
        Ok(deleted == 1)
    }
}

//! Redis-backed lane store.
//!
//! Lanes are sorted sets scored by enqueue time, tickets are hashes holding the
//! JSON ticket plus a separately addressable `state` field, and active markers
//! are plain string keys. Multi-key writes and compare-and-set steps run as Lua
//! scripts so each trait method stays one atomic primitive. A lane leaves
//! `mm:lanes` in the same script that empties it; retired tickets expire.

use std::time::Duration;

use redis::{Commands, Script};

use wager_core::{TicketId, UserId};
use wager_matchmaking::keys::{LANE_INDEX, active_key, lane_key, ticket_key};
use wager_matchmaking::{LaneKey, SeekTicket, TicketState};

use super::r#trait::{LaneStore, LaneStoreError};

const INSERT_SCRIPT: &str = r#"
if not redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  return 0
end
redis.call('HSET', KEYS[2], 'data', ARGV[2], 'state', ARGV[3], 'round', ARGV[6])
redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
redis.call('SADD', KEYS[4], ARGV[5])
return 1
"#;

const TRANSITION_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') == ARGV[1] then
  redis.call('HSET', KEYS[1], 'state', ARGV[2])
  return 1
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'MATCHED' then
  return 0
end
if tonumber(redis.call('HGET', KEYS[1], 'round') or '0') ~= tonumber(ARGV[1]) then
  return 0
end
redis.call('HSET', KEYS[1], 'state', ARGV[2])
if ARGV[2] == 'SEEKING' then
  redis.call('HINCRBY', KEYS[1], 'round', 1)
end
return 1
"#;

const POP_SCRIPT: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1], ARGV[1])
if redis.call('ZCARD', KEYS[1]) == 0 then
  redis.call('SREM', KEYS[2], KEYS[1])
end
return popped
"#;

const PUSH_BACK_SCRIPT: &str = r#"
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
redis.call('SADD', KEYS[2], KEYS[1])
return 1
"#;

const REMOVE_SCRIPT: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
if redis.call('ZCARD', KEYS[1]) == 0 then
  redis.call('SREM', KEYS[2], KEYS[1])
end
return removed
"#;

const CLEAR_ACTIVE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Debug, Clone)]
pub struct RedisLaneStore {
    client: redis::Client,
}

impl RedisLaneStore {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LaneStoreError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(redis_error)?;
        Ok(Self { client })
    }

    fn conn(&self) -> Result<redis::Connection, LaneStoreError> {
        self.client.get_connection().map_err(redis_error)
    }
}

impl LaneStore for RedisLaneStore {
    fn insert(&self, ticket: &SeekTicket) -> Result<(), LaneStoreError> {
        let data = serde_json::to_string(ticket)
            .map_err(|e| LaneStoreError::Invalid(format!("failed to encode ticket: {e}")))?;
        let lane = lane_key(&ticket.lane);
        let mut conn = self.conn()?;

        let inserted: i64 = Script::new(INSERT_SCRIPT)
            .key(active_key(&ticket.lane, ticket.user_id))
            .key(ticket_key(ticket.ticket_id))
            .key(&lane)
            .key(LANE_INDEX)
            .arg(ticket.ticket_id.to_string())
            .arg(data)
            .arg(ticket.state.as_str())
            .arg(ticket.enqueued_at_ms)
            .arg(&lane)
            .arg(ticket.round)
            .invoke(&mut conn)
            .map_err(redis_error)?;

        if inserted == 0 {
            return Err(LaneStoreError::ActiveSeek(format!(
                "user {} already seeks in {lane}",
                ticket.user_id
            )));
        }
        Ok(())
    }

    fn ticket(&self, ticket_id: TicketId) -> Result<Option<SeekTicket>, LaneStoreError> {
        let mut conn = self.conn()?;
        let (data, state, round): (Option<String>, Option<String>, Option<u32>) =
            redis::cmd("HMGET")
                .arg(ticket_key(ticket_id))
                .arg("data")
                .arg("state")
                .arg("round")
                .query(&mut conn)
                .map_err(redis_error)?;

        let (Some(data), Some(state)) = (data, state) else {
            return Ok(None);
        };
        let mut ticket: SeekTicket = serde_json::from_str(&data)
            .map_err(|e| LaneStoreError::Invalid(format!("failed to decode ticket {ticket_id}: {e}")))?;
        ticket.state = state
            .parse()
            .map_err(|e: wager_core::DomainError| LaneStoreError::Invalid(e.to_string()))?;
        ticket.round = round.unwrap_or(ticket.round);
        Ok(Some(ticket))
    }

    fn transition(
        &self,
        ticket_id: TicketId,
        from: TicketState,
        to: TicketState,
    ) -> Result<bool, LaneStoreError> {
        let mut conn = self.conn()?;
        let swapped: i64 = Script::new(TRANSITION_SCRIPT)
            .key(ticket_key(ticket_id))
            .arg(from.as_str())
            .arg(to.as_str())
            .invoke(&mut conn)
            .map_err(redis_error)?;
        Ok(swapped == 1)
    }

    fn release_matched(
        &self,
        ticket_id: TicketId,
        round: u32,
        to: TicketState,
    ) -> Result<bool, LaneStoreError> {
        if to == TicketState::Matched {
            return Err(LaneStoreError::Invalid(
                "a matched ticket is released to SEEKING or CANCELLED".to_string(),
            ));
        }
        let mut conn = self.conn()?;
        let released: i64 = Script::new(RELEASE_SCRIPT)
            .key(ticket_key(ticket_id))
            .arg(round)
            .arg(to.as_str())
            .invoke(&mut conn)
            .map_err(redis_error)?;
        Ok(released == 1)
    }

    fn retire(&self, ticket_id: TicketId, retain_for: Duration) -> Result<(), LaneStoreError> {
        let mut conn = self.conn()?;
        // PEXPIRE rejects zero; one millisecond is as good as gone.
        let millis = u64::try_from(retain_for.as_millis()).unwrap_or(u64::MAX).max(1);
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(ticket_key(ticket_id))
            .arg(millis)
            .query(&mut conn)
            .map_err(redis_error)?;
        Ok(())
    }

    fn pop_oldest(
        &self,
        lane: &LaneKey,
        count: usize,
    ) -> Result<Vec<(TicketId, i64)>, LaneStoreError> {
        let mut conn = self.conn()?;
        let popped: Vec<(String, f64)> = Script::new(POP_SCRIPT)
            .key(lane_key(lane))
            .key(LANE_INDEX)
            .arg(count)
            .invoke(&mut conn)
            .map_err(redis_error)?;

        popped
            .into_iter()
            .map(|(member, score)| {
                let id: TicketId = member
                    .parse()
                    .map_err(|e: wager_core::DomainError| LaneStoreError::Invalid(e.to_string()))?;
                Ok((id, score as i64))
            })
            .collect()
    }

    fn push_back(
        &self,
        lane: &LaneKey,
        ticket_id: TicketId,
        score: i64,
    ) -> Result<(), LaneStoreError> {
        let mut conn = self.conn()?;
        let _: i64 = Script::new(PUSH_BACK_SCRIPT)
            .key(lane_key(lane))
            .key(LANE_INDEX)
            .arg(score)
            .arg(ticket_id.to_string())
            .invoke(&mut conn)
            .map_err(redis_error)?;
        Ok(())
    }

    fn remove(&self, lane: &LaneKey, ticket_id: TicketId) -> Result<bool, LaneStoreError> {
        let mut conn = self.conn()?;
        let removed: i64 = Script::new(REMOVE_SCRIPT)
            .key(lane_key(lane))
            .key(LANE_INDEX)
            .arg(ticket_id.to_string())
            .invoke(&mut conn)
            .map_err(redis_error)?;
        Ok(removed > 0)
    }

    fn set_active(
        &self,
        lane: &LaneKey,
        user_id: UserId,
        ticket_id: TicketId,
    ) -> Result<bool, LaneStoreError> {
        let mut conn = self.conn()?;
        let set: Option<String> = redis::cmd("SET")
            .arg(active_key(lane, user_id))
            .arg(ticket_id.to_string())
            .arg("NX")
            .query(&mut conn)
            .map_err(redis_error)?;
        Ok(set.is_some())
    }

    fn clear_active(
        &self,
        lane: &LaneKey,
        user_id: UserId,
        ticket_id: TicketId,
    ) -> Result<(), LaneStoreError> {
        let mut conn = self.conn()?;
        let _: i64 = Script::new(CLEAR_ACTIVE_SCRIPT)
            .key(active_key(lane, user_id))
            .arg(ticket_id.to_string())
            .invoke(&mut conn)
            .map_err(redis_error)?;
        Ok(())
    }

    fn depth(&self, lane: &LaneKey) -> Result<usize, LaneStoreError> {
        let mut conn = self.conn()?;
        conn.zcard(lane_key(lane)).map_err(redis_error)
    }

    fn lanes(&self) -> Result<Vec<LaneKey>, LaneStoreError> {
        let mut conn = self.conn()?;
        let members: Vec<String> = conn.smembers(LANE_INDEX).map_err(redis_error)?;
        let mut lanes = members
            .iter()
            .map(|raw| {
                raw.parse()
                    .map_err(|e: wager_core::DomainError| LaneStoreError::Invalid(e.to_string()))
            })
            .collect::<Result<Vec<LaneKey>, _>>()?;
        lanes.sort();
        Ok(lanes)
    }
}

fn redis_error(err: redis::RedisError) -> LaneStoreError {
    LaneStoreError::Unavailable(err.to_string())
}

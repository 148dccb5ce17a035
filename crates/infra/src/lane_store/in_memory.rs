use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use wager_core::{TicketId, UserId};
use wager_matchmaking::{LaneKey, SeekTicket, TicketState};

use super::r#trait::{LaneStore, LaneStoreError};

#[derive(Debug, Default)]
struct State {
    /// Ordered by (score, ticket id); the first entry is the oldest.
    /// Emptied lanes are removed.
    lanes: BTreeMap<LaneKey, BTreeSet<(i64, TicketId)>>,
    tickets: HashMap<TicketId, SeekTicket>,
    /// Retired tickets and when they disappear.
    expires: HashMap<TicketId, Instant>,
    active: HashMap<(LaneKey, UserId), TicketId>,
}

impl State {
    fn live_ticket(&mut self, ticket_id: TicketId, now: Instant) -> Option<&mut SeekTicket> {
        if self.expires.get(&ticket_id).is_some_and(|at| *at <= now) {
            self.expires.remove(&ticket_id);
            self.tickets.remove(&ticket_id);
            return None;
        }
        self.tickets.get_mut(&ticket_id)
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<TicketId> = self
            .expires
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.expires.remove(&id);
            self.tickets.remove(&id);
        }
    }

    fn drop_if_empty(&mut self, lane: &LaneKey) {
        if self.lanes.get(lane).is_some_and(BTreeSet::is_empty) {
            self.lanes.remove(lane);
        }
    }
}

/// In-memory lane store: one critical section per primitive.
#[derive(Debug, Default)]
pub struct InMemoryLaneStore {
    state: Mutex<State>,
}

impl InMemoryLaneStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, LaneStoreError> {
        self.state
            .lock()
            .map_err(|_| LaneStoreError::Unavailable("lock poisoned".to_string()))
    }

    /// Ticket records held, retired ones included until they expire.
    pub fn stored_tickets(&self) -> Result<usize, LaneStoreError> {
        let mut state = self.lock()?;
        state.purge_expired(Instant::now());
        Ok(state.tickets.len())
    }
}

impl LaneStore for InMemoryLaneStore {
    fn insert(&self, ticket: &SeekTicket) -> Result<(), LaneStoreError> {
        let mut state = self.lock()?;
        state.purge_expired(Instant::now());
        let marker = (ticket.lane.clone(), ticket.user_id);
        if let Some(holder) = state.active.get(&marker) {
            return Err(LaneStoreError::ActiveSeek(format!(
                "user {} already seeks in {} with ticket {holder}",
                ticket.user_id, ticket.lane
            )));
        }
        state.active.insert(marker, ticket.ticket_id);
        state.tickets.insert(ticket.ticket_id, ticket.clone());
        state
            .lanes
            .entry(ticket.lane.clone())
            .or_default()
            .insert((ticket.enqueued_at_ms, ticket.ticket_id));
        Ok(())
    }

    fn ticket(&self, ticket_id: TicketId) -> Result<Option<SeekTicket>, LaneStoreError> {
        let mut state = self.lock()?;
        Ok(state.live_ticket(ticket_id, Instant::now()).cloned())
    }

    fn transition(
        &self,
        ticket_id: TicketId,
        from: TicketState,
        to: TicketState,
    ) -> Result<bool, LaneStoreError> {
        let mut state = self.lock()?;
        match state.live_ticket(ticket_id, Instant::now()) {
            Some(ticket) if ticket.state == from => {
                ticket.state = to;
                Ok(true)
            }
            _ => Ok(false),
        }
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
        let mut state = self.lock()?;
        match state.live_ticket(ticket_id, Instant::now()) {
            Some(ticket) if ticket.state == TicketState::Matched && ticket.round == round => {
                ticket.state = to;
                if to == TicketState::Seeking {
                    ticket.round += 1;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn retire(&self, ticket_id: TicketId, retain_for: Duration) -> Result<(), LaneStoreError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        if state.live_ticket(ticket_id, now).is_some() {
            let at = now.checked_add(retain_for).unwrap_or(now);
            state.expires.insert(ticket_id, at);
        }
        Ok(())
    }

    fn pop_oldest(
        &self,
        lane: &LaneKey,
        count: usize,
    ) -> Result<Vec<(TicketId, i64)>, LaneStoreError> {
        let mut state = self.lock()?;
        let Some(members) = state.lanes.get_mut(lane) else {
            return Ok(Vec::new());
        };
        let mut popped = Vec::with_capacity(count);
        while popped.len() < count {
            match members.pop_first() {
                Some((score, id)) => popped.push((id, score)),
                None => break,
            }
        }
        state.drop_if_empty(lane);
        Ok(popped)
    }

    fn push_back(
        &self,
        lane: &LaneKey,
        ticket_id: TicketId,
        score: i64,
    ) -> Result<(), LaneStoreError> {
        let mut state = self.lock()?;
        state
            .lanes
            .entry(lane.clone())
            .or_default()
            .insert((score, ticket_id));
        Ok(())
    }

    fn remove(&self, lane: &LaneKey, ticket_id: TicketId) -> Result<bool, LaneStoreError> {
        let mut state = self.lock()?;
        let Some(members) = state.lanes.get_mut(lane) else {
            return Ok(false);
        };
        let before = members.len();
        members.retain(|(_, id)| *id != ticket_id);
        let removed = members.len() != before;
        state.drop_if_empty(lane);
        Ok(removed)
    }

    fn set_active(
        &self,
        lane: &LaneKey,
        user_id: UserId,
        ticket_id: TicketId,
    ) -> Result<bool, LaneStoreError> {
        let mut state = self.lock()?;
        let marker = (lane.clone(), user_id);
        if state.active.contains_key(&marker) {
            return Ok(false);
        }
        state.active.insert(marker, ticket_id);
        Ok(true)
    }

    fn clear_active(
        &self,
        lane: &LaneKey,
        user_id: UserId,
        ticket_id: TicketId,
    ) -> Result<(), LaneStoreError> {
        let mut state = self.lock()?;
        let marker = (lane.clone(), user_id);
        if state.active.get(&marker) == Some(&ticket_id) {
            state.active.remove(&marker);
        }
        Ok(())
    }

    fn depth(&self, lane: &LaneKey) -> Result<usize, LaneStoreError> {
        Ok(self.lock()?.lanes.get(lane).map_or(0, BTreeSet::len))
    }

    fn lanes(&self) -> Result<Vec<LaneKey>, LaneStoreError> {
        Ok(self.lock()?.lanes.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wager_matchmaking::{Mode, SeekRequest};

    fn ticket(user_id: UserId, at: i64) -> SeekTicket {
        let req = SeekRequest {
            user_id,
            game_id: "G".to_string(),
            mode: Mode::CloudStream,
            stake_minor: 500,
            region: "EU".to_string(),
            elo_band: "1000-1200".parse().unwrap(),
            ping_hint: Some(40),
        };
        SeekTicket::open(&req, at).unwrap()
    }

    #[test]
    fn pops_in_enqueue_order() {
        let store = InMemoryLaneStore::new();
        let late = ticket(UserId::new(), 300);
        let early = ticket(UserId::new(), 100);
        store.insert(&late).unwrap();
        store.insert(&early).unwrap();

        let popped = store.pop_oldest(&early.lane, 2).unwrap();
        assert_eq!(popped, vec![(early.ticket_id, 100), (late.ticket_id, 300)]);
        assert_eq!(store.depth(&early.lane).unwrap(), 0);
    }

    #[test]
    fn emptied_lanes_leave_the_index() {
        let store = InMemoryLaneStore::new();
        let t = ticket(UserId::new(), 1);
        store.insert(&t).unwrap();
        assert_eq!(store.lanes().unwrap(), vec![t.lane.clone()]);

        store.pop_oldest(&t.lane, 2).unwrap();
        assert!(store.lanes().unwrap().is_empty());

        store.push_back(&t.lane, t.ticket_id, 1).unwrap();
        assert_eq!(store.lanes().unwrap(), vec![t.lane.clone()]);
        assert!(store.remove(&t.lane, t.ticket_id).unwrap());
        assert!(store.lanes().unwrap().is_empty());
    }

    #[test]
    fn retired_tickets_disappear_after_their_retention() {
        let store = InMemoryLaneStore::new();
        let kept = ticket(UserId::new(), 1);
        let gone = ticket(UserId::new(), 2);
        store.insert(&kept).unwrap();
        store.insert(&gone).unwrap();

        store.retire(kept.ticket_id, Duration::from_secs(3_600)).unwrap();
        store.retire(gone.ticket_id, Duration::ZERO).unwrap();

        assert!(store.ticket(kept.ticket_id).unwrap().is_some());
        assert!(store.ticket(gone.ticket_id).unwrap().is_none());
        assert!(!store
            .transition(gone.ticket_id, TicketState::Seeking, TicketState::Cancelled)
            .unwrap());
        assert_eq!(store.stored_tickets().unwrap(), 1);
    }

    #[test]
    fn release_is_bound_to_the_round() {
        let store = InMemoryLaneStore::new();
        let t = ticket(UserId::new(), 1);
        store.insert(&t).unwrap();
        store
            .transition(t.ticket_id, TicketState::Seeking, TicketState::Matched)
            .unwrap();

        assert!(store
            .release_matched(t.ticket_id, 0, TicketState::Seeking)
            .unwrap());
        let requeued = store.ticket(t.ticket_id).unwrap().unwrap();
        assert_eq!(requeued.state, TicketState::Seeking);
        assert_eq!(requeued.round, 1);

        store
            .transition(t.ticket_id, TicketState::Seeking, TicketState::Matched)
            .unwrap();
        // A release meant for the first match must not touch the second.
        assert!(!store
            .release_matched(t.ticket_id, 0, TicketState::Cancelled)
            .unwrap());
        assert!(store
            .release_matched(t.ticket_id, 1, TicketState::Cancelled)
            .unwrap());
        assert!(store
            .release_matched(t.ticket_id, 1, TicketState::Matched)
            .is_err());
    }

    #[test]
    fn second_seek_in_same_lane_is_rejected() {
        let store = InMemoryLaneStore::new();
        let user = UserId::new();
        store.insert(&ticket(user, 1)).unwrap();
        let err = store.insert(&ticket(user, 2)).unwrap_err();
        assert!(matches!(err, LaneStoreError::ActiveSeek(_)));
    }

    #[test]
    fn stale_clear_leaves_a_newer_marker_alone() {
        let store = InMemoryLaneStore::new();
        let user = UserId::new();
        let first = ticket(user, 1);
        store.insert(&first).unwrap();
        store.clear_active(&first.lane, user, first.ticket_id).unwrap();

        let second = ticket(user, 2);
        store.insert(&second).unwrap();
        store.clear_active(&first.lane, user, first.ticket_id).unwrap();
        assert!(!store.set_active(&second.lane, user, second.ticket_id).unwrap());
    }

    #[test]
    fn transition_is_compare_and_set() {
        let store = InMemoryLaneStore::new();
        let t = ticket(UserId::new(), 1);
        store.insert(&t).unwrap();

        assert!(store
            .transition(t.ticket_id, TicketState::Seeking, TicketState::Matched)
            .unwrap());
        assert!(!store
            .transition(t.ticket_id, TicketState::Seeking, TicketState::Cancelled)
            .unwrap());
        assert_eq!(
            store.ticket(t.ticket_id).unwrap().unwrap().state,
            TicketState::Matched
        );
    }
}

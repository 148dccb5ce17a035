//! Matchmaking queue service.
//!
//! Pairing protocol for one lane:
//! 1. pop the two oldest tickets (or one, plus a widening partner)
//! 2. lease `mm:lock:match:{matchId}` for the pair id, derived from both
//!    ticket ids and their requeue rounds
//! 3. confirm both tickets are still SEEKING in that round, CAS both to MATCHED
//! 4. store the FORMED match, drop both active markers, release the lease
//!
//! Anything that fails along the way pushes surviving tickets back with their
//! original score, so queue position is never lost. A ticket sent back after
//! a failed match starts a new round and pairs under a new match id.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use wager_core::{DomainError, MatchId, TicketId};
use wager_matchmaking::{
    LaneKey, Match, MatchStatus, SeekRequest, SeekTicket, TicketState, WideningPolicy,
};

use crate::lane_store::{LaneStore, LaneStoreError};
use crate::match_lock::{LockError, MatchLock};
use crate::match_store::{MatchStore, MatchStoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub lock_lease: Duration,
    /// Local retries of a lane after a lost race.
    pub max_attempts: u32,
    pub widening: WideningPolicy,
    /// How long a cancelled or settled ticket stays readable.
    pub ticket_retention: Duration,
    /// Age after which a match still FORMED is escrowed again by the
    /// matching cycle.
    pub escrow_redrive_after: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lock_lease: Duration::from_millis(5_000),
            max_attempts: 8,
            widening: WideningPolicy::default(),
            ticket_retention: Duration::from_secs(3_600),
            escrow_redrive_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("matchmaking unavailable: {0}")]
    Fatal(String),
}

impl From<LaneStoreError> for QueueError {
    fn from(err: LaneStoreError) -> Self {
        match err {
            LaneStoreError::ActiveSeek(msg) => QueueError::Domain(DomainError::duplicate_seek(msg)),
            LaneStoreError::Invalid(msg) | LaneStoreError::Unavailable(msg) => QueueError::Fatal(msg),
        }
    }
}

impl From<LockError> for QueueError {
    fn from(err: LockError) -> Self {
        QueueError::Fatal(err.to_string())
    }
}

impl From<MatchStoreError> for QueueError {
    fn from(err: MatchStoreError) -> Self {
        match err {
            MatchStoreError::Concurrency(msg) => QueueError::Domain(DomainError::conflict(msg)),
            MatchStoreError::NotFound(msg) => QueueError::Domain(DomainError::not_found(msg)),
            MatchStoreError::Invalid(msg) | MatchStoreError::Unavailable(msg) => QueueError::Fatal(msg),
        }
    }
}

/// A popped lane member.
#[derive(Debug, Clone)]
struct Slot {
    lane: LaneKey,
    ticket_id: TicketId,
    score: i64,
}

enum Pairing {
    Formed(Match),
    /// Nothing to pair right now; tickets stay queued.
    Waiting,
    /// Lost a race; try the lane again.
    Retry(&'static str),
}

pub struct MatchmakingQueue {
    lanes: Arc<dyn LaneStore>,
    locks: Arc<dyn MatchLock>,
    matches: Arc<dyn MatchStore>,
    config: QueueConfig,
}

impl MatchmakingQueue {
    pub fn new(
        lanes: Arc<dyn LaneStore>,
        locks: Arc<dyn MatchLock>,
        matches: Arc<dyn MatchStore>,
        config: QueueConfig,
    ) -> Self {
        Self {
            lanes,
            locks,
            matches,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn seek(&self, request: SeekRequest) -> Result<SeekTicket, QueueError> {
        self.seek_at(request, Utc::now().timestamp_millis())
    }

    /// Enqueue with an explicit enqueue time (lane score).
    #[instrument(skip(self, request), fields(user_id = %request.user_id), err)]
    pub fn seek_at(&self, request: SeekRequest, enqueued_at_ms: i64) -> Result<SeekTicket, QueueError> {
        let ticket = SeekTicket::open(&request, enqueued_at_ms)?;
        self.lanes.insert(&ticket)?;
        info!(ticket_id = %ticket.ticket_id, lane = %ticket.lane, "ticket enqueued");
        Ok(ticket)
    }

    /// `false` when the ticket is absent, already matched or already cancelled.
    #[instrument(skip(self), err)]
    pub fn cancel(&self, ticket_id: TicketId) -> Result<bool, QueueError> {
        let Some(ticket) = self.lanes.ticket(ticket_id)? else {
            return Ok(false);
        };
        if !self
            .lanes
            .transition(ticket_id, TicketState::Seeking, TicketState::Cancelled)?
        {
            debug!(state = ticket.state.as_str(), "cancel is a no-op");
            return Ok(false);
        }
        self.lanes.remove(&ticket.lane, ticket_id)?;
        self.lanes
            .clear_active(&ticket.lane, ticket.user_id, ticket_id)?;
        self.retire(ticket_id)?;
        info!(lane = %ticket.lane, "ticket cancelled");
        Ok(true)
    }

    /// Retire a ticket matched in `round` whose match fell through by its
    /// owner's fault.
    pub fn cancel_matched(&self, ticket_id: TicketId, round: u32) -> Result<bool, QueueError> {
        let cancelled = self
            .lanes
            .release_matched(ticket_id, round, TicketState::Cancelled)?;
        if cancelled {
            self.retire(ticket_id)?;
        }
        Ok(cancelled)
    }

    /// The ticket's match went through; keep the record only for the
    /// retention window.
    pub fn settle_matched(&self, ticket_id: TicketId) -> Result<(), QueueError> {
        self.retire(ticket_id)
    }

    /// Whether the ticket is still MATCHED in `round`.
    pub fn holds(&self, ticket_id: TicketId, round: u32) -> Result<bool, QueueError> {
        Ok(self
            .lanes
            .ticket(ticket_id)?
            .is_some_and(|t| t.state == TicketState::Matched && t.round == round))
    }

    /// Put a ticket matched in `round` back in its lane with its original
    /// score. The ticket enters the next round.
    ///
    /// If the player has seeked again in the meantime the old ticket is
    /// cancelled instead, keeping one active ticket per (lane, user).
    #[instrument(skip(self), err)]
    pub fn requeue(&self, ticket_id: TicketId, round: u32) -> Result<bool, QueueError> {
        let Some(ticket) = self.lanes.ticket(ticket_id)? else {
            return Ok(false);
        };
        if ticket.state != TicketState::Matched || ticket.round != round {
            return Ok(false);
        }

        if !self
            .lanes
            .set_active(&ticket.lane, ticket.user_id, ticket_id)?
        {
            if self
                .lanes
                .release_matched(ticket_id, round, TicketState::Cancelled)?
            {
                self.retire(ticket_id)?;
            }
            info!("player already seeks again; old ticket cancelled");
            return Ok(false);
        }
        if !self
            .lanes
            .release_matched(ticket_id, round, TicketState::Seeking)?
        {
            self.lanes
                .clear_active(&ticket.lane, ticket.user_id, ticket_id)?;
            return Ok(false);
        }
        self.lanes
            .push_back(&ticket.lane, ticket_id, ticket.enqueued_at_ms)?;
        info!(lane = %ticket.lane, round = round + 1, "ticket requeued");
        Ok(true)
    }

    pub fn match_lane(&self, lane: &LaneKey) -> Result<Option<Match>, QueueError> {
        self.match_lane_at(lane, Utc::now().timestamp_millis())
    }

    /// Try to form one match in `lane`. `None` means keep waiting.
    #[instrument(skip(self, lane), fields(lane = %lane), err)]
    pub fn match_lane_at(&self, lane: &LaneKey, now_ms: i64) -> Result<Option<Match>, QueueError> {
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.try_match(lane, now_ms)? {
                Pairing::Formed(m) => return Ok(Some(m)),
                Pairing::Waiting => return Ok(None),
                Pairing::Retry(reason) => debug!(attempt, reason, "pairing attempt lost a race"),
            }
        }
        debug!(attempts, "pairing attempts exhausted; tickets stay queued");
        Ok(None)
    }

    pub fn run_once(&self) -> Result<Vec<Match>, QueueError> {
        self.run_once_at(Utc::now().timestamp_millis())
    }

    /// Drain every lane of the pairs it can currently form.
    pub fn run_once_at(&self, now_ms: i64) -> Result<Vec<Match>, QueueError> {
        let mut formed = Vec::new();
        for lane in self.lanes.lanes()? {
            while let Some(m) = self.match_lane_at(&lane, now_ms)? {
                formed.push(m);
            }
        }
        Ok(formed)
    }

    pub fn depth(&self, lane: &LaneKey) -> Result<usize, QueueError> {
        Ok(self.lanes.depth(lane)?)
    }

    pub fn lanes(&self) -> Result<Vec<LaneKey>, QueueError> {
        Ok(self.lanes.lanes()?)
    }

    pub fn get_ticket(&self, ticket_id: TicketId) -> Result<Option<SeekTicket>, QueueError> {
        Ok(self.lanes.ticket(ticket_id)?)
    }

    fn try_match(&self, lane: &LaneKey, now_ms: i64) -> Result<Pairing, QueueError> {
        let popped = self.lanes.pop_oldest(lane, 2)?;
        let mut slots = popped.into_iter().map(|(ticket_id, score)| Slot {
            lane: lane.clone(),
            ticket_id,
            score,
        });

        match (slots.next(), slots.next()) {
            (None, _) => Ok(Pairing::Waiting),
            (Some(a), Some(b)) => self.try_pair(a, b),
            (Some(lone), None) => self.try_widen(lone, now_ms),
        }
    }

    fn try_widen(&self, lone: Slot, now_ms: i64) -> Result<Pairing, QueueError> {
        let Some(ticket) = self
            .lanes
            .ticket(lone.ticket_id)?
            .filter(SeekTicket::is_seeking)
        else {
            return Ok(Pairing::Retry("dropped a stale ticket"));
        };

        let waited = Duration::from_millis(u64::try_from(ticket.waited_ms(now_ms)).unwrap_or(0));
        let steps = self.config.widening.steps_for(waited);
        for adjacent in lone.lane.adjacent(steps) {
            if let Some((ticket_id, score)) = self.lanes.pop_oldest(&adjacent, 1)?.into_iter().next() {
                debug!(from = %lone.lane, to = %adjacent, "widened search found a candidate");
                let partner = Slot {
                    lane: adjacent,
                    ticket_id,
                    score,
                };
                return self.try_pair(lone, partner);
            }
        }

        self.push_back(&lone)?;
        Ok(Pairing::Waiting)
    }

    fn try_pair(&self, a: Slot, b: Slot) -> Result<Pairing, QueueError> {
        let live_a = self.lanes.ticket(a.ticket_id)?.filter(SeekTicket::is_seeking);
        let live_b = self.lanes.ticket(b.ticket_id)?.filter(SeekTicket::is_seeking);
        let (ta, tb) = match (live_a, live_b) {
            (Some(ta), Some(tb)) => (ta, tb),
            (left, right) => {
                if left.is_some() {
                    self.push_back(&a)?;
                }
                if right.is_some() {
                    self.push_back(&b)?;
                }
                return Ok(Pairing::Retry("candidate no longer seeking"));
            }
        };

        let match_id = MatchId::for_rounds((ta.ticket_id, ta.round), (tb.ticket_id, tb.round));
        let Some(token) = self.locks.acquire(match_id, self.config.lock_lease)? else {
            self.push_back(&a)?;
            self.push_back(&b)?;
            return Ok(Pairing::Retry("match lock held elsewhere"));
        };

        let outcome = self.pair_locked(&a, &b, [ta.round, tb.round]);
        if outcome.is_err() {
            // Best effort: a failed step must not strand queued tickets.
            for slot in [&a, &b] {
                if let Ok(Some(t)) = self.lanes.ticket(slot.ticket_id) {
                    if t.is_seeking() {
                        let _ = self.push_back(slot);
                    }
                }
            }
        }

        match self.locks.release(&token) {
            Ok(true) => {}
            Ok(false) => warn!(%match_id, "match lock lease expired before release"),
            Err(err) => warn!(%match_id, error = %err, "failed to release match lock"),
        }
        outcome
    }

    fn pair_locked(&self, a: &Slot, b: &Slot, rounds: [u32; 2]) -> Result<Pairing, QueueError> {
        let live_a = self
            .lanes
            .ticket(a.ticket_id)?
            .filter(|t| t.is_seeking() && t.round == rounds[0]);
        let live_b = self
            .lanes
            .ticket(b.ticket_id)?
            .filter(|t| t.is_seeking() && t.round == rounds[1]);

        let (ta, tb) = match (live_a, live_b) {
            (Some(ta), Some(tb)) => (ta, tb),
            (left, right) => {
                if left.is_some() {
                    self.push_back(a)?;
                }
                if right.is_some() {
                    self.push_back(b)?;
                }
                return Ok(Pairing::Retry("candidate no longer seeking"));
            }
        };

        // Widening can surface the same player seeking in two bands.
        if ta.user_id == tb.user_id || ta.stake_minor() != tb.stake_minor() {
            self.push_back(a)?;
            self.push_back(b)?;
            return Ok(Pairing::Waiting);
        }
        let formed = Match::formed(&ta, &tb, Utc::now())?;

        if !self
            .lanes
            .transition(a.ticket_id, TicketState::Seeking, TicketState::Matched)?
        {
            self.push_back(b)?;
            return Ok(Pairing::Retry("candidate cancelled while pairing"));
        }
        if !self
            .lanes
            .transition(b.ticket_id, TicketState::Seeking, TicketState::Matched)?
        {
            self.lanes
                .transition(a.ticket_id, TicketState::Matched, TicketState::Seeking)?;
            self.push_back(a)?;
            return Ok(Pairing::Retry("candidate cancelled while pairing"));
        }

        let record = match self.store_formed(formed) {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.unwind(&[(a, &ta), (b, &tb)])?;
                return Ok(Pairing::Retry("match id already used"));
            }
            Err(err) => {
                self.unwind(&[(a, &ta), (b, &tb)])?;
                return Err(err);
            }
        };

        self.lanes.clear_active(&ta.lane, ta.user_id, ta.ticket_id)?;
        self.lanes.clear_active(&tb.lane, tb.user_id, tb.ticket_id)?;

        info!(
            match_id = %record.match_id,
            players = ?record.players,
            stake_minor = record.stake_minor,
            "match formed"
        );
        Ok(Pairing::Formed(record))
    }

    /// Store a new FORMED match. An existing record is reused only while it
    /// is still FORMED; `None` means the id belongs to a match that moved on.
    fn store_formed(&self, record: Match) -> Result<Option<Match>, QueueError> {
        if self.matches.insert(&record)? {
            return Ok(Some(record));
        }
        match self.matches.get(record.match_id)? {
            Some(existing) if existing.status == MatchStatus::Formed => Ok(Some(existing)),
            Some(existing) => {
                warn!(
                    match_id = %existing.match_id,
                    status = existing.status.as_str(),
                    "pair id already used by an earlier match"
                );
                Ok(None)
            }
            None => Err(QueueError::Fatal(format!(
                "match {} neither inserted nor found",
                record.match_id
            ))),
        }
    }

    /// Send tickets matched in this attempt back to their lanes in a new
    /// round. Their active markers are still held.
    fn unwind(&self, pair: &[(&Slot, &SeekTicket); 2]) -> Result<(), QueueError> {
        for (slot, ticket) in pair {
            if self
                .lanes
                .release_matched(ticket.ticket_id, ticket.round, TicketState::Seeking)?
            {
                self.push_back(slot)?;
            }
        }
        Ok(())
    }

    fn retire(&self, ticket_id: TicketId) -> Result<(), QueueError> {
        self.lanes.retire(ticket_id, self.config.ticket_retention)?;
        Ok(())
    }

    fn push_back(&self, slot: &Slot) -> Result<(), QueueError> {
        self.lanes
            .push_back(&slot.lane, slot.ticket_id, slot.score)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    use wager_core::{ExpectedVersion, UserId};
    use wager_matchmaking::{EloBand, Mode};

    use crate::lane_store::InMemoryLaneStore;
    use crate::match_lock::InMemoryMatchLock;
    use crate::match_store::InMemoryMatchStore;

    fn queue_with(config: QueueConfig) -> (MatchmakingQueue, Arc<InMemoryMatchLock>) {
        let locks = Arc::new(InMemoryMatchLock::new());
        let queue = MatchmakingQueue::new(
            Arc::new(InMemoryLaneStore::new()),
            locks.clone(),
            Arc::new(InMemoryMatchStore::new()),
            config,
        );
        (queue, locks)
    }

    fn queue() -> MatchmakingQueue {
        queue_with(QueueConfig::default()).0
    }

    fn queue_over(matches: Arc<InMemoryMatchStore>) -> MatchmakingQueue {
        MatchmakingQueue::new(
            Arc::new(InMemoryLaneStore::new()),
            Arc::new(InMemoryMatchLock::new()),
            matches,
            QueueConfig::default(),
        )
    }

    fn request(band: &str) -> SeekRequest {
        staked(band, 500)
    }

    fn staked(band: &str, stake_minor: i64) -> SeekRequest {
        SeekRequest {
            user_id: UserId::new(),
            game_id: "fc25".to_string(),
            mode: Mode::ConsoleVerifiedStream,
            stake_minor,
            region: "NA".to_string(),
            elo_band: band.parse().unwrap(),
            ping_hint: None,
        }
    }

    fn widening_on() -> QueueConfig {
        QueueConfig {
            widening: WideningPolicy {
                enabled: true,
                ..WideningPolicy::default()
            },
            ..QueueConfig::default()
        }
    }

    #[test]
    fn pairs_the_two_oldest_tickets() {
        let q = queue();
        let t1 = q.seek_at(request("1200-1400"), 100).unwrap();
        let t2 = q.seek_at(request("1200-1400"), 200).unwrap();
        let t3 = q.seek_at(request("1200-1400"), 300).unwrap();

        let m = q.match_lane_at(&t1.lane, 400).unwrap().unwrap();
        let mut expected = [t1.ticket_id, t2.ticket_id];
        expected.sort();
        assert_eq!(m.tickets, expected);
        assert_eq!(m.match_id, MatchId::for_pair(t1.ticket_id, t2.ticket_id));
        assert_eq!(q.depth(&t1.lane).unwrap(), 1);

        let left = q.get_ticket(t3.ticket_id).unwrap().unwrap();
        assert!(left.is_seeking());
        assert_eq!(
            q.get_ticket(t1.ticket_id).unwrap().unwrap().state,
            TicketState::Matched
        );
    }

    #[test]
    fn duplicate_seek_in_the_same_lane_is_rejected() {
        let q = queue();
        let req = request("1200-1400");
        q.seek(req.clone()).unwrap();
        let err = q.seek(req).unwrap_err();
        assert!(matches!(err, QueueError::Domain(DomainError::DuplicateSeek(_))));
    }

    #[test]
    fn player_can_seek_again_after_being_matched() {
        let q = queue();
        let req = request("1200-1400");
        let t1 = q.seek_at(req.clone(), 1).unwrap();
        q.seek_at(request("1200-1400"), 2).unwrap();
        q.match_lane_at(&t1.lane, 3).unwrap().unwrap();

        assert!(q.seek_at(req, 4).is_ok());
    }

    #[test]
    fn cancel_removes_the_ticket_and_is_a_no_op_afterwards() {
        let q = queue();
        let t = q.seek(request("1200-1400")).unwrap();
        assert!(q.cancel(t.ticket_id).unwrap());
        assert_eq!(q.depth(&t.lane).unwrap(), 0);
        assert!(!q.cancel(t.ticket_id).unwrap());
        assert!(!q.cancel(TicketId::new()).unwrap());
    }

    #[test]
    fn cancel_after_match_changes_nothing() {
        let q = queue();
        let t1 = q.seek_at(request("1200-1400"), 1).unwrap();
        q.seek_at(request("1200-1400"), 2).unwrap();
        q.match_lane_at(&t1.lane, 3).unwrap().unwrap();

        assert!(!q.cancel(t1.ticket_id).unwrap());
        assert_eq!(
            q.get_ticket(t1.ticket_id).unwrap().unwrap().state,
            TicketState::Matched
        );
    }

    #[test]
    fn lone_ticket_keeps_waiting_without_widening() {
        let q = queue();
        let t = q.seek_at(request("1200-1400"), 0).unwrap();
        q.seek_at(request("1400-1600"), 0).unwrap();

        assert!(q.match_lane_at(&t.lane, 600_000).unwrap().is_none());
        assert_eq!(q.depth(&t.lane).unwrap(), 1);
    }

    #[test]
    fn widening_reaches_an_adjacent_band_after_the_threshold() {
        let (q, _) = queue_with(widening_on());
        let t = q.seek_at(request("1200-1400"), 0).unwrap();
        let other = q.seek_at(request("1400-1600"), 0).unwrap();

        assert!(q.match_lane_at(&t.lane, 10_000).unwrap().is_none());

        let m = q.match_lane_at(&t.lane, 31_000).unwrap().unwrap();
        assert!(m.tickets.contains(&other.ticket_id));
        assert_eq!(q.depth(&other.lane).unwrap(), 0);
        assert_eq!(other.lane.elo_band, EloBand::new(1400, 1600).unwrap());
    }

    #[test]
    fn a_different_stake_is_never_paired() {
        for config in [QueueConfig::default(), widening_on()] {
            let widening = config.widening.enabled;
            let (q, _) = queue_with(config);
            let t1 = q.seek_at(staked("1200-1400", 500), 0).unwrap();
            let t2 = q.seek_at(staked("1200-1400", 500), 1).unwrap();
            let big = q.seek_at(staked("1200-1400", 1_000), 2).unwrap();

            // Long past every widening step.
            let formed = q.run_once_at(3_600_000).unwrap();
            assert_eq!(formed.len(), 1, "widening={widening}");
            let mut expected = [t1.ticket_id, t2.ticket_id];
            expected.sort();
            assert_eq!(formed[0].tickets, expected);

            assert!(q.run_once_at(7_200_000).unwrap().is_empty());
            assert!(q.get_ticket(big.ticket_id).unwrap().unwrap().is_seeking());
            assert_eq!(q.depth(&big.lane).unwrap(), 1);
        }
    }

    #[test]
    fn requeued_pair_forms_a_fresh_match() {
        let store = Arc::new(InMemoryMatchStore::new());
        let q = queue_over(Arc::clone(&store));
        let t1 = q.seek_at(request("1200-1400"), 1).unwrap();
        let t2 = q.seek_at(request("1200-1400"), 2).unwrap();

        let mut first = q.match_lane_at(&t1.lane, 3).unwrap().unwrap();
        let expected = ExpectedVersion::Exact(first.version);
        first.fail("escrow failed", Utc::now()).unwrap();
        store.update(&first, expected).unwrap();
        assert!(q.requeue(t1.ticket_id, 0).unwrap());
        assert!(q.requeue(t2.ticket_id, 0).unwrap());

        let second = q.match_lane_at(&t1.lane, 4).unwrap().unwrap();
        assert_ne!(second.match_id, first.match_id);
        assert_eq!(second.status, MatchStatus::Formed);
        assert_eq!(second.rounds, [1, 1]);
        for t in [t1.ticket_id, t2.ticket_id] {
            assert_eq!(q.get_ticket(t).unwrap().unwrap().state, TicketState::Matched);
        }
    }

    #[test]
    fn pair_id_taken_by_a_finished_match_is_not_reused() {
        let store = Arc::new(InMemoryMatchStore::new());
        let q = queue_over(Arc::clone(&store));
        let t1 = q.seek_at(request("1200-1400"), 1).unwrap();
        let t2 = q.seek_at(request("1200-1400"), 2).unwrap();

        let mut stale = Match::formed(&t1, &t2, Utc::now()).unwrap();
        stale.status = MatchStatus::Failed;
        assert!(store.insert(&stale).unwrap());

        let m = q.match_lane_at(&t1.lane, 3).unwrap().unwrap();
        assert_ne!(m.match_id, stale.match_id);
        assert_eq!(m.status, MatchStatus::Formed);
        assert_eq!(store.get(stale.match_id).unwrap().unwrap().status, MatchStatus::Failed);
    }

    #[test]
    fn finished_tickets_and_empty_lanes_are_dropped() {
        let (q, _) = queue_with(QueueConfig {
            ticket_retention: Duration::ZERO,
            ..QueueConfig::default()
        });
        let cancelled = q.seek_at(request("1000-1200"), 1).unwrap();
        assert!(q.cancel(cancelled.ticket_id).unwrap());
        assert!(q.get_ticket(cancelled.ticket_id).unwrap().is_none());

        let t1 = q.seek_at(request("1200-1400"), 1).unwrap();
        q.seek_at(request("1200-1400"), 2).unwrap();
        q.match_lane_at(&t1.lane, 3).unwrap().unwrap();
        assert!(q.lanes().unwrap().is_empty());

        assert!(q.holds(t1.ticket_id, 0).unwrap());
        q.settle_matched(t1.ticket_id).unwrap();
        assert!(q.get_ticket(t1.ticket_id).unwrap().is_none());
    }

    #[test]
    fn held_lock_leaves_both_tickets_queued() {
        let (q, locks) = queue_with(QueueConfig {
            max_attempts: 2,
            ..QueueConfig::default()
        });
        let t1 = q.seek_at(request("1200-1400"), 1).unwrap();
        let t2 = q.seek_at(request("1200-1400"), 2).unwrap();
        let held = locks
            .acquire(MatchId::for_pair(t1.ticket_id, t2.ticket_id), Duration::from_secs(30))
            .unwrap()
            .unwrap();

        assert!(q.match_lane_at(&t1.lane, 3).unwrap().is_none());
        assert_eq!(q.depth(&t1.lane).unwrap(), 2);

        locks.release(&held).unwrap();
        assert!(q.match_lane_at(&t1.lane, 4).unwrap().is_some());
    }

    #[test]
    fn requeue_restores_the_original_position() {
        let q = queue();
        let t1 = q.seek_at(request("1200-1400"), 10).unwrap();
        q.seek_at(request("1200-1400"), 20).unwrap();
        q.match_lane_at(&t1.lane, 30).unwrap().unwrap();
        let t3 = q.seek_at(request("1200-1400"), 40).unwrap();

        assert!(q.requeue(t1.ticket_id, 0).unwrap());
        assert!(!q.requeue(t1.ticket_id, 0).unwrap());
        assert_eq!(q.get_ticket(t1.ticket_id).unwrap().unwrap().round, 1);
        let t4 = q.seek_at(request("1200-1400"), 50).unwrap();

        let m = q.match_lane_at(&t1.lane, 60).unwrap().unwrap();
        let mut expected = [t1.ticket_id, t3.ticket_id];
        expected.sort();
        assert_eq!(m.tickets, expected);
        assert!(q.get_ticket(t4.ticket_id).unwrap().unwrap().is_seeking());
    }

    #[test]
    fn concurrent_matchers_never_double_match() {
        let q = Arc::new(queue());
        let lane = request("1200-1400").lane();
        for i in 0..100 {
            q.seek_at(request("1200-1400"), i).unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || q.run_once_at(1_000).unwrap())
            })
            .collect();
        let formed: Vec<Match> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        let mut seen = HashSet::new();
        for m in &formed {
            for t in m.tickets {
                assert!(seen.insert(t), "ticket {t} matched twice");
            }
        }
        assert_eq!(formed.len() + q.depth(&lane).unwrap() / 2, 50);
    }
}

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use wager_core::{TicketId, UserId};
use wager_matchmaking::{LaneKey, SeekTicket, TicketState};

#[derive(Debug, Error)]
pub enum LaneStoreError {
    /// The user already holds an active marker in the lane.
    #[error("active seek exists: {0}")]
    ActiveSeek(String),

    #[error("invalid data: {0}")]
    Invalid(String),

    #[error("lane store unavailable: {0}")]
    Unavailable(String),
}

/// Lanes, tickets and active markers.
///
/// Every method is one atomic primitive; the queue service composes them.
/// Implementations must guarantee:
/// - a popped ticket id is handed to exactly one caller
/// - `transition` is a compare-and-set on the ticket state
/// - at most one active marker exists per (lane, user)
/// - a lane with no queued member is absent from `lanes`
pub trait LaneStore: Send + Sync {
    /// Claim the (lane, user) marker, store the ticket and enqueue it with
    /// `score = enqueued_at_ms`, all or nothing. `ActiveSeek` if the marker is held.
    fn insert(&self, ticket: &SeekTicket) -> Result<(), LaneStoreError>;

    fn ticket(&self, ticket_id: TicketId) -> Result<Option<SeekTicket>, LaneStoreError>;

    /// Set the ticket state to `to` only if it is currently `from`.
    fn transition(
        &self,
        ticket_id: TicketId,
        from: TicketState,
        to: TicketState,
    ) -> Result<bool, LaneStoreError>;

    /// Move a MATCHED ticket to `to`, but only while it is still in `round`.
    /// Going back to SEEKING starts the next round.
    fn release_matched(
        &self,
        ticket_id: TicketId,
        round: u32,
        to: TicketState,
    ) -> Result<bool, LaneStoreError>;

    /// Keep a finished ticket readable for `retain_for`, then drop it.
    fn retire(&self, ticket_id: TicketId, retain_for: Duration) -> Result<(), LaneStoreError>;

    /// Remove and return up to `count` oldest members with their scores.
    fn pop_oldest(
        &self,
        lane: &LaneKey,
        count: usize,
    ) -> Result<Vec<(TicketId, i64)>, LaneStoreError>;

    /// Re-add a member with its original score.
    fn push_back(&self, lane: &LaneKey, ticket_id: TicketId, score: i64)
    -> Result<(), LaneStoreError>;

    /// Remove a member; `false` if it was not queued.
    fn remove(&self, lane: &LaneKey, ticket_id: TicketId) -> Result<bool, LaneStoreError>;

    /// Claim the marker for an existing ticket (requeue). `false` if held.
    fn set_active(
        &self,
        lane: &LaneKey,
        user_id: UserId,
        ticket_id: TicketId,
    ) -> Result<bool, LaneStoreError>;

    /// Drop the marker, but only while it still points at `ticket_id`.
    fn clear_active(
        &self,
        lane: &LaneKey,
        user_id: UserId,
        ticket_id: TicketId,
    ) -> Result<(), LaneStoreError>;

    fn depth(&self, lane: &LaneKey) -> Result<usize, LaneStoreError>;

    /// Every lane with at least one queued ticket.
    fn lanes(&self) -> Result<Vec<LaneKey>, LaneStoreError>;
}

impl<S> LaneStore for Arc<S>
where
    S: LaneStore + ?Sized,
{
    fn insert(&self, ticket: &SeekTicket) -> Result<(), LaneStoreError> {
        (**self).insert(ticket)
    }

    fn ticket(&self, ticket_id: TicketId) -> Result<Option<SeekTicket>, LaneStoreError> {
        (**self).ticket(ticket_id)
    }

    fn transition(
        &self,
        ticket_id: TicketId,
        from: TicketState,
        to: TicketState,
    ) -> Result<bool, LaneStoreError> {
        (**self).transition(ticket_id, from, to)
    }

    fn release_matched(
        &self,
        ticket_id: TicketId,
        round: u32,
        to: TicketState,
    ) -> Result<bool, LaneStoreError> {
        (**self).release_matched(ticket_id, round, to)
    }

    fn retire(&self, ticket_id: TicketId, retain_for: Duration) -> Result<(), LaneStoreError> {
        (**self).retire(ticket_id, retain_for)
    }

    fn pop_oldest(
        &self,
        lane: &LaneKey,
        count: usize,
    ) -> Result<Vec<(TicketId, i64)>, LaneStoreError> {
        (**self).pop_oldest(lane, count)
    }

    fn push_back(
        &self,
        lane: &LaneKey,
        ticket_id: TicketId,
        score: i64,
    ) -> Result<(), LaneStoreError> {
        (**self).push_back(lane, ticket_id, score)
    }

    fn remove(&self, lane: &LaneKey, ticket_id: TicketId) -> Result<bool, LaneStoreError> {
        (**self).remove(lane, ticket_id)
    }

    fn set_active(
        &self,
        lane: &LaneKey,
        user_id: UserId,
        ticket_id: TicketId,
    ) -> Result<bool, LaneStoreError> {
        (**self).set_active(lane, user_id, ticket_id)
    }

    fn clear_active(
        &self,
        lane: &LaneKey,
        user_id: UserId,
        ticket_id: TicketId,
    ) -> Result<(), LaneStoreError> {
        (**self).clear_active(lane, user_id, ticket_id)
    }

    fn depth(&self, lane: &LaneKey) -> Result<usize, LaneStoreError> {
        (**self).depth(lane)
    }

    fn lanes(&self) -> Result<Vec<LaneKey>, LaneStoreError> {
        (**self).lanes()
    }
}

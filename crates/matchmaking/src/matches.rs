use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wager_core::{AggregateRoot, DomainError, DomainResult, MatchId, MinorUnits, TicketId, UserId};

use crate::ticket::{Mode, SeekTicket};

/// Match lifecycle.
///
/// `FORMED -> ESCROWED -> LIVE -> RESOLVING -> {PAID | REFUNDED | FAILED}`,
/// plus `FORMED -> FAILED` (escrow failed) and `ESCROWED -> RESOLVING`
/// (resolved without an explicit live signal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    Formed,
    Escrowed,
    Live,
    Resolving,
    Paid,
    Refunded,
    Failed,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Formed => "FORMED",
            MatchStatus::Escrowed => "ESCROWED",
            MatchStatus::Live => "LIVE",
            MatchStatus::Resolving => "RESOLVING",
            MatchStatus::Paid => "PAID",
            MatchStatus::Refunded => "REFUNDED",
            MatchStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MatchStatus::Paid | MatchStatus::Refunded | MatchStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: MatchStatus) -> bool {
        use MatchStatus::*;
        matches!(
            (self, next),
            (Formed, Escrowed)
                | (Formed, Failed)
                | (Escrowed, Live)
                | (Escrowed, Resolving)
                | (Live, Resolving)
                | (Resolving, Paid)
                | (Resolving, Refunded)
                | (Resolving, Failed)
        )
    }
}

impl core::str::FromStr for MatchStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FORMED" => Ok(MatchStatus::Formed),
            "ESCROWED" => Ok(MatchStatus::Escrowed),
            "LIVE" => Ok(MatchStatus::Live),
            "RESOLVING" => Ok(MatchStatus::Resolving),
            "PAID" => Ok(MatchStatus::Paid),
            "REFUNDED" => Ok(MatchStatus::Refunded),
            "FAILED" => Ok(MatchStatus::Failed),
            other => Err(DomainError::validation(format!("unknown match status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionKind {
    Payout { winner_id: UserId },
    Refund { reason: String },
}

/// The single terminal call a match accepts, recorded on entering RESOLVING.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    #[serde(flatten)]
    pub kind: ResolutionKind,
    pub idempotency_key: String,
}

impl Resolution {
    pub fn payout(winner_id: UserId, idempotency_key: impl Into<String>) -> Self {
        Self {
            kind: ResolutionKind::Payout { winner_id },
            idempotency_key: idempotency_key.into(),
        }
    }

    pub fn refund(reason: impl Into<String>, idempotency_key: impl Into<String>) -> Self {
        Self {
            kind: ResolutionKind::Refund {
                reason: reason.into(),
            },
            idempotency_key: idempotency_key.into(),
        }
    }

    /// Whether `other` is a retry of this call (same kind, winner and key).
    pub fn is_same_call(&self, other: &Resolution) -> bool {
        if self.idempotency_key != other.idempotency_key {
            return false;
        }
        match (&self.kind, &other.kind) {
            (ResolutionKind::Payout { winner_id: a }, ResolutionKind::Payout { winner_id: b }) => {
                a == b
            }
            (ResolutionKind::Refund { .. }, ResolutionKind::Refund { .. }) => true,
            _ => false,
        }
    }
}

/// Outcome of asking a match to accept a terminal call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStart {
    /// The call was recorded; the match is now RESOLVING.
    Fresh,
    /// The same call was already recorded; drive it to completion again.
    Replay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub match_id: MatchId,
    pub game_id: String,
    pub mode: Mode,
    pub region: String,
    pub players: [UserId; 2],
    pub tickets: [TicketId; 2],
    /// Requeue round of each ticket when the pair formed.
    #[serde(default)]
    pub rounds: [u32; 2],
    pub stake_minor: MinorUnits,
    pub status: MatchStatus,
    pub resolution: Option<Resolution>,
    pub failure_reason: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Match {
    /// FORMED match for a validated ticket pair. Tickets are ordered by id so
    /// the record is identical whichever matcher built it.
    pub fn formed(a: &SeekTicket, b: &SeekTicket, now: DateTime<Utc>) -> DomainResult<Self> {
        if a.ticket_id == b.ticket_id || a.user_id == b.user_id {
            return Err(DomainError::invariant("a match needs two distinct players"));
        }
        if a.stake_minor() != b.stake_minor() {
            return Err(DomainError::invariant("matched tickets must stake the same amount"));
        }
        let (first, second) = if a.ticket_id <= b.ticket_id { (a, b) } else { (b, a) };
        Ok(Self {
            match_id: MatchId::for_rounds(
                (first.ticket_id, first.round),
                (second.ticket_id, second.round),
            ),
            game_id: first.lane.game_id.clone(),
            mode: first.lane.mode,
            region: first.lane.region.clone(),
            players: [first.user_id, second.user_id],
            tickets: [first.ticket_id, second.ticket_id],
            rounds: [first.round, second.round],
            stake_minor: first.stake_minor(),
            status: MatchStatus::Formed,
            resolution: None,
            failure_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn has_player(&self, user_id: UserId) -> bool {
        self.players.contains(&user_id)
    }

    pub fn ticket_of(&self, user_id: UserId) -> Option<TicketId> {
        self.players
            .iter()
            .position(|p| *p == user_id)
            .map(|i| self.tickets[i])
    }

    pub fn pot_minor(&self) -> MinorUnits {
        self.stake_minor.saturating_mul(2)
    }

    pub fn transition(&mut self, next: MatchStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::conflict(format!(
                "match {} cannot move from {} to {}",
                self.match_id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(MatchStatus::Failed, now)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Accept at most one terminal call: record it and enter RESOLVING, or
    /// recognise a retry of the call already recorded.
    pub fn begin_resolution(
        &mut self,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> DomainResult<ResolutionStart> {
        if let Some(existing) = &self.resolution {
            if existing.is_same_call(&resolution) {
                return Ok(ResolutionStart::Replay);
            }
            return Err(DomainError::conflict(format!(
                "match {} already has a terminal request (key '{}')",
                self.match_id, existing.idempotency_key
            )));
        }

        if let ResolutionKind::Payout { winner_id } = &resolution.kind {
            if !self.has_player(*winner_id) {
                return Err(DomainError::validation(format!(
                    "winner {winner_id} is not a player in match {}",
                    self.match_id
                )));
            }
        }

        self.transition(MatchStatus::Resolving, now)?;
        self.resolution = Some(resolution);
        Ok(ResolutionStart::Fresh)
    }
}

impl AggregateRoot for Match {
    type Id = MatchId;

    fn id(&self) -> &Self::Id {
        &self.match_id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::SeekRequest;

    fn ticket(stake: MinorUnits, at: i64) -> SeekTicket {
        let req = SeekRequest {
            user_id: UserId::new(),
            game_id: "G".to_string(),
            mode: Mode::ConsoleVerifiedStream,
            stake_minor: stake,
            region: "NA".to_string(),
            elo_band: "1200-1400".parse().unwrap(),
            ping_hint: None,
        };
        SeekTicket::open(&req, at).unwrap()
    }

    fn escrowed() -> Match {
        let mut m = Match::formed(&ticket(500, 0), &ticket(500, 3_000), Utc::now()).unwrap();
        m.transition(MatchStatus::Escrowed, Utc::now()).unwrap();
        m
    }

    #[test]
    fn formed_match_is_identical_whichever_order_the_pair_arrives() {
        let a = ticket(500, 0);
        let b = ticket(500, 3_000);
        let now = Utc::now();
        assert_eq!(
            Match::formed(&a, &b, now).unwrap(),
            Match::formed(&b, &a, now).unwrap()
        );
    }

    #[test]
    fn requeued_ticket_forms_under_a_new_id() {
        let a = ticket(500, 0);
        let mut b = ticket(500, 3_000);
        let first = Match::formed(&a, &b, Utc::now()).unwrap();
        b.round = 1;
        let second = Match::formed(&a, &b, Utc::now()).unwrap();
        assert_ne!(first.match_id, second.match_id);
        assert_eq!(second.tickets, first.tickets);
        let i = second.tickets.iter().position(|t| *t == b.ticket_id).unwrap();
        assert_eq!(second.rounds[i], 1);
    }

    #[test]
    fn different_stakes_never_form_a_match() {
        assert!(Match::formed(&ticket(500, 0), &ticket(1000, 0), Utc::now()).is_err());
    }

    #[test]
    fn escrowed_can_resolve_without_live() {
        let mut m = escrowed();
        let winner = m.players[0];
        let start = m
            .begin_resolution(Resolution::payout(winner, "k2"), Utc::now())
            .unwrap();
        assert_eq!(start, ResolutionStart::Fresh);
        assert_eq!(m.status, MatchStatus::Resolving);
    }

    #[test]
    fn second_terminal_call_conflicts_unless_it_is_a_retry() {
        let mut m = escrowed();
        let winner = m.players[1];
        m.begin_resolution(Resolution::payout(winner, "k2"), Utc::now())
            .unwrap();

        let retry = m
            .begin_resolution(Resolution::payout(winner, "k2"), Utc::now())
            .unwrap();
        assert_eq!(retry, ResolutionStart::Replay);

        let refund = m.begin_resolution(Resolution::refund("timeout", "k3"), Utc::now());
        assert!(matches!(refund, Err(DomainError::Conflict(_))));

        let other_winner = m.begin_resolution(Resolution::payout(m.players[0], "k2"), Utc::now());
        assert!(matches!(other_winner, Err(DomainError::Conflict(_))));
    }

    #[test]
    fn formed_match_cannot_be_resolved() {
        let mut m = Match::formed(&ticket(500, 0), &ticket(500, 0), Utc::now()).unwrap();
        let res = m.begin_resolution(Resolution::refund("timeout", "k"), Utc::now());
        assert!(matches!(res, Err(DomainError::Conflict(_))));
        assert!(m.resolution.is_none());
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for s in [MatchStatus::Paid, MatchStatus::Refunded, MatchStatus::Failed] {
            assert!(s.is_terminal());
            assert!(!s.can_transition_to(MatchStatus::Resolving));
        }
    }

    #[test]
    fn resolution_serializes_flat() {
        let r = Resolution::refund("timeout", "k9");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["kind"], "refund");
        assert_eq!(json["reason"], "timeout");
        assert_eq!(json["idempotency_key"], "k9");
    }
}

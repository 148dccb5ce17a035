use core::str::FromStr;

use serde::{Deserialize, Serialize};

use wager_core::{DomainError, DomainResult, MinorUnits, TicketId, UserId};

use crate::keys;
use crate::lane::{EloBand, LaneKey};

/// How the match is played and verified.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    ConsoleVerifiedStream,
    CloudStream,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::ConsoleVerifiedStream => "CONSOLE_VERIFIED_STREAM",
            Mode::CloudStream => "CLOUD_STREAM",
        }
    }
}

impl FromStr for Mode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONSOLE_VERIFIED_STREAM" => Ok(Mode::ConsoleVerifiedStream),
            "CLOUD_STREAM" => Ok(Mode::CloudStream),
            other => Err(DomainError::validation(format!("unknown mode '{other}'"))),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketState {
    Seeking,
    Matched,
    Cancelled,
}

impl TicketState {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketState::Seeking => "SEEKING",
            TicketState::Matched => "MATCHED",
            TicketState::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for TicketState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SEEKING" => Ok(TicketState::Seeking),
            "MATCHED" => Ok(TicketState::Matched),
            "CANCELLED" => Ok(TicketState::Cancelled),
            other => Err(DomainError::validation(format!("unknown ticket state '{other}'"))),
        }
    }
}

/// Upper bound accepted for a client-reported ping hint.
pub const MAX_PING_HINT_MS: u32 = 10_000;

/// A player's request to be matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeekRequest {
    pub user_id: UserId,
    pub game_id: String,
    pub mode: Mode,
    pub stake_minor: MinorUnits,
    pub region: String,
    pub elo_band: EloBand,
    pub ping_hint: Option<u32>,
}

impl SeekRequest {
    /// Reject malformed input before it reaches the queue.
    pub fn validate(&self) -> DomainResult<()> {
        keys::check_segment("gameId", &self.game_id)?;
        keys::check_segment("region", &self.region)?;
        if self.stake_minor <= 0 {
            return Err(DomainError::validation("stakeMinor must be a positive integer"));
        }
        if let Some(ping) = self.ping_hint {
            if ping > MAX_PING_HINT_MS {
                return Err(DomainError::validation(format!(
                    "pingHint must be at most {MAX_PING_HINT_MS} ms"
                )));
            }
        }
        Ok(())
    }

    pub fn lane(&self) -> LaneKey {
        LaneKey {
            game_id: self.game_id.clone(),
            mode: self.mode,
            region: self.region.clone(),
            stake_minor: self.stake_minor,
            elo_band: self.elo_band,
        }
    }
}

/// One player's active matchmaking request within a lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeekTicket {
    pub ticket_id: TicketId,
    pub user_id: UserId,
    pub lane: LaneKey,
    pub ping_hint: Option<u32>,
    /// Lane score: enqueue time in epoch milliseconds.
    pub enqueued_at_ms: i64,
    pub state: TicketState,
    /// Times the ticket went back to its lane after a failed match. Part of
    /// the match identity, so a requeued pair never reuses an old match id.
    #[serde(default)]
    pub round: u32,
}

impl SeekTicket {
    pub fn open(request: &SeekRequest, enqueued_at_ms: i64) -> DomainResult<Self> {
        request.validate()?;
        Ok(Self {
            ticket_id: TicketId::new(),
            user_id: request.user_id,
            lane: request.lane(),
            ping_hint: request.ping_hint,
            enqueued_at_ms,
            state: TicketState::Seeking,
            round: 0,
        })
    }

    pub fn is_seeking(&self) -> bool {
        self.state == TicketState::Seeking
    }

    pub fn stake_minor(&self) -> MinorUnits {
        self.lane.stake_minor
    }

    /// Milliseconds spent waiting as of `now_ms`.
    pub fn waited_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.enqueued_at_ms).max(0)
    }

    /// Whether the ticket can move from its current state to `next`.
    pub fn can_transition(&self, next: TicketState) -> bool {
        matches!(
            (self.state, next),
            (TicketState::Seeking, TicketState::Matched)
                | (TicketState::Seeking, TicketState::Cancelled)
                | (TicketState::Matched, TicketState::Seeking)
                | (TicketState::Matched, TicketState::Cancelled)
        )
    }
}

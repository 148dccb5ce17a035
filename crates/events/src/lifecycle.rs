//! Match and server lifecycle events.
//!
//! Every topic has a fixed schema: adjacently tagged enums (`type` + `data`)
//! whose payload structs reject unknown fields. A payload that does not match
//! one of these shapes fails to deserialize instead of passing through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wager_core::{MatchId, MinorUnits, TransactionId, UserId};

use crate::event::Event;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchFormed {
    pub match_id: MatchId,
    pub game_id: String,
    pub players: [UserId; 2],
    pub stake_minor: MinorUnits,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchEscrowed {
    pub match_id: MatchId,
    pub pot_minor: MinorUnits,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchLive {
    pub match_id: MatchId,
    pub occurred_at: DateTime<Utc>,
}

/// A referee reported the winner. The idempotency key travels with the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchResultReported {
    pub match_id: MatchId,
    pub winner_id: UserId,
    pub idempotency_key: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    Timeout,
    NoResult,
    DisputeUnresolved,
}

impl AbandonReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AbandonReason::Timeout => "timeout",
            AbandonReason::NoResult => "no_result",
            AbandonReason::DisputeUnresolved => "dispute_unresolved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchAbandoned {
    pub match_id: MatchId,
    pub reason: AbandonReason,
    pub idempotency_key: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchPaid {
    pub match_id: MatchId,
    pub winner_id: UserId,
    pub transaction_id: TransactionId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchRefunded {
    pub match_id: MatchId,
    pub transaction_id: TransactionId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchFailed {
    pub match_id: MatchId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Events published on the match lifecycle topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MatchLifecycleEvent {
    Formed(MatchFormed),
    Escrowed(MatchEscrowed),
    Live(MatchLive),
    ResultReported(MatchResultReported),
    Abandoned(MatchAbandoned),
    Paid(MatchPaid),
    Refunded(MatchRefunded),
    Failed(MatchFailed),
}

impl MatchLifecycleEvent {
    pub fn match_id(&self) -> MatchId {
        match self {
            MatchLifecycleEvent::Formed(e) => e.match_id,
            MatchLifecycleEvent::Escrowed(e) => e.match_id,
            MatchLifecycleEvent::Live(e) => e.match_id,
            MatchLifecycleEvent::ResultReported(e) => e.match_id,
            MatchLifecycleEvent::Abandoned(e) => e.match_id,
            MatchLifecycleEvent::Paid(e) => e.match_id,
            MatchLifecycleEvent::Refunded(e) => e.match_id,
            MatchLifecycleEvent::Failed(e) => e.match_id,
        }
    }
}

impl Event for MatchLifecycleEvent {
    fn event_type(&self) -> &'static str {
        match self {
            MatchLifecycleEvent::Formed(_) => "match.formed",
            MatchLifecycleEvent::Escrowed(_) => "match.escrowed",
            MatchLifecycleEvent::Live(_) => "match.live",
            MatchLifecycleEvent::ResultReported(_) => "match.result_reported",
            MatchLifecycleEvent::Abandoned(_) => "match.abandoned",
            MatchLifecycleEvent::Paid(_) => "match.paid",
            MatchLifecycleEvent::Refunded(_) => "match.refunded",
            MatchLifecycleEvent::Failed(_) => "match.failed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            MatchLifecycleEvent::Formed(e) => e.occurred_at,
            MatchLifecycleEvent::Escrowed(e) => e.occurred_at,
            MatchLifecycleEvent::Live(e) => e.occurred_at,
            MatchLifecycleEvent::ResultReported(e) => e.occurred_at,
            MatchLifecycleEvent::Abandoned(e) => e.occurred_at,
            MatchLifecycleEvent::Paid(e) => e.occurred_at,
            MatchLifecycleEvent::Refunded(e) => e.occurred_at,
            MatchLifecycleEvent::Failed(e) => e.occurred_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerStarted {
    pub server_id: String,
    pub match_id: MatchId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerStopped {
    pub server_id: String,
    pub match_id: MatchId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerCrashed {
    pub server_id: String,
    pub match_id: MatchId,
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Events published on the game-server lifecycle topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerLifecycleEvent {
    Started(ServerStarted),
    Stopped(ServerStopped),
    Crashed(ServerCrashed),
}

impl ServerLifecycleEvent {
    pub fn match_id(&self) -> MatchId {
        match self {
            ServerLifecycleEvent::Started(e) => e.match_id,
            ServerLifecycleEvent::Stopped(e) => e.match_id,
            ServerLifecycleEvent::Crashed(e) => e.match_id,
        }
    }
}

impl Event for ServerLifecycleEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ServerLifecycleEvent::Started(_) => "server.started",
            ServerLifecycleEvent::Stopped(_) => "server.stopped",
            ServerLifecycleEvent::Crashed(_) => "server.crashed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ServerLifecycleEvent::Started(e) => e.occurred_at,
            ServerLifecycleEvent::Stopped(e) => e.occurred_at,
            ServerLifecycleEvent::Crashed(e) => e.occurred_at,
        }
    }
}

/// Union of every event the coordinator consumes or publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family", content = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Match(MatchLifecycleEvent),
    Server(ServerLifecycleEvent),
}

impl LifecycleEvent {
    pub fn match_id(&self) -> MatchId {
        match self {
            LifecycleEvent::Match(e) => e.match_id(),
            LifecycleEvent::Server(e) => e.match_id(),
        }
    }
}

impl Event for LifecycleEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LifecycleEvent::Match(e) => e.event_type(),
            LifecycleEvent::Server(e) => e.event_type(),
        }
    }

    fn version(&self) -> u32 {
        match self {
            LifecycleEvent::Match(e) => e.version(),
            LifecycleEvent::Server(e) => e.version(),
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LifecycleEvent::Match(e) => e.occurred_at(),
            LifecycleEvent::Server(e) => e.occurred_at(),
        }
    }
}

impl From<MatchLifecycleEvent> for LifecycleEvent {
    fn from(value: MatchLifecycleEvent) -> Self {
        LifecycleEvent::Match(value)
    }
}

impl From<ServerLifecycleEvent> for LifecycleEvent {
    fn from(value: ServerLifecycleEvent) -> Self {
        LifecycleEvent::Server(value)
    }
}

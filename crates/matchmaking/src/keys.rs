//! Stable key-naming scheme for queue state.
//!
//! Monitoring and admin tooling read these keys directly, so the formats are
//! part of the external contract:
//!
//! | what          | key                                                          |
//! |---------------|--------------------------------------------------------------|
//! | lane          | `mm:lane:{gameId}:{mode}:{region}:{stakeMinor}:{eloMin}-{eloMax}` |
//! | ticket        | `mm:ticket:{ticketId}`                                       |
//! | active marker | `mm:active:{laneKey}:{userId}`                               |
//! | match lock    | `mm:lock:match:{matchId}`                                    |
//! | lane index    | `mm:lanes`                                                   |

use wager_core::{DomainError, DomainResult, MatchId, TicketId, UserId};

use crate::lane::LaneKey;

pub const LANE_PREFIX: &str = "mm:lane:";
pub const TICKET_PREFIX: &str = "mm:ticket:";
pub const ACTIVE_PREFIX: &str = "mm:active:";
pub const MATCH_LOCK_PREFIX: &str = "mm:lock:match:";
/// Set of every lane key that has ever held a ticket.
pub const LANE_INDEX: &str = "mm:lanes";

pub fn lane_key(lane: &LaneKey) -> String {
    format!(
        "{LANE_PREFIX}{}:{}:{}:{}:{}",
        lane.game_id,
        lane.mode.as_str(),
        lane.region,
        lane.stake_minor,
        lane.elo_band
    )
}

pub fn ticket_key(ticket_id: TicketId) -> String {
    format!("{TICKET_PREFIX}{ticket_id}")
}

pub fn active_key(lane: &LaneKey, user_id: UserId) -> String {
    format!("{ACTIVE_PREFIX}{}:{user_id}", lane_key(lane))
}

pub fn match_lock_key(match_id: MatchId) -> String {
    format!("{MATCH_LOCK_PREFIX}{match_id}")
}

/// A free-text key segment must be non-empty and must not contain the separator.
pub fn check_segment<'a>(field: &str, value: &'a str) -> DomainResult<&'a str> {
    let ok = !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !ok {
        return Err(DomainError::validation(format!(
            "{field} must be 1-64 characters of [A-Za-z0-9._-], got '{value}'"
        )));
    }
    Ok(value)
}

//! Matchmaking domain module.
//!
//! Seek validation, tickets, lanes and their stable key scheme, the widening
//! policy for adjacent skill bands, and the match record with its status
//! machine. Pure logic: lane storage and locking live in `wager-infra`.

pub mod keys;
pub mod lane;
pub mod matches;
pub mod ticket;
pub mod widening;

pub use lane::{EloBand, LaneKey};
pub use matches::{Match, MatchStatus, Resolution, ResolutionKind, ResolutionStart};
pub use ticket::{Mode, SeekRequest, SeekTicket, TicketState};
pub use widening::WideningPolicy;

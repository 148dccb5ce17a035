//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a player (actor identity).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

/// Identifier of a ledger account (HOUSE or USER).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(Uuid);

/// Identifier of a single ledger transaction row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

/// Identifier of a logical ledger operation (groups the rows it wrote).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

/// Identifier of a matchmaking ticket.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(Uuid);

/// Identifier of a match.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(UserId, "UserId");
impl_uuid_newtype!(AccountId, "AccountId");
impl_uuid_newtype!(TransactionId, "TransactionId");
impl_uuid_newtype!(OperationId, "OperationId");
impl_uuid_newtype!(TicketId, "TicketId");
impl_uuid_newtype!(MatchId, "MatchId");

/// Namespace for match ids derived from ticket pairs.
const MATCH_NAMESPACE: Uuid = Uuid::from_u128(0x6d61_7463_682d_7061_6972_2d6e_7331_0001);

impl MatchId {
    /// Deterministic match id for a ticket pair (order-insensitive).
    ///
    /// Every matcher that pops the same pair derives the same id, so they all
    /// contend for the same match lock.
    pub fn for_pair(a: TicketId, b: TicketId) -> Self {
        Self::for_rounds((a, 0), (b, 0))
    }

    /// Match id for a pair of tickets at their current requeue rounds.
    ///
    /// A ticket that went back to the queue after a failed match pairs under
    /// a new id, even with the same partner. Round zero on both sides gives
    /// the same id as [`MatchId::for_pair`].
    pub fn for_rounds(a: (TicketId, u32), b: (TicketId, u32)) -> Self {
        let (lo, hi) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        let mut name = Vec::with_capacity(40);
        name.extend_from_slice(lo.0.as_uuid().as_bytes());
        name.extend_from_slice(hi.0.as_uuid().as_bytes());
        if lo.1 != 0 || hi.1 != 0 {
            name.extend_from_slice(&lo.1.to_be_bytes());
            name.extend_from_slice(&hi.1.to_be_bytes());
        }
        Self(Uuid::new_v5(&MATCH_NAMESPACE, &name))
    }
}

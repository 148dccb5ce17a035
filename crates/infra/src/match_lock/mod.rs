//! Lease locks guarding match-candidate pairing.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_lease;
pub mod r#trait;

pub use in_memory::InMemoryMatchLock;
#[cfg(feature = "redis")]
pub use redis_lease::RedisMatchLock;
pub use r#trait::{LockError, LockToken, MatchLock};

//! Lane storage for the matchmaking queue.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_lanes;
pub mod r#trait;

pub use in_memory::InMemoryLaneStore;
#[cfg(feature = "redis")]
pub use redis_lanes::RedisLaneStore;
pub use r#trait::{LaneStore, LaneStoreError};

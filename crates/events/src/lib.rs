//! Lifecycle events and the pub/sub mechanics that carry them.
//!
//! - `event`: the domain-agnostic `Event` trait
//! - `lifecycle`: the closed set of match/server lifecycle events
//! - `topics`: injected topic names
//! - `envelope`, `bus`, `in_memory_bus`: transport mechanics

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod lifecycle;
pub mod topics;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use lifecycle::{
    AbandonReason, LifecycleEvent, MatchAbandoned, MatchEscrowed, MatchFailed, MatchFormed,
    MatchLifecycleEvent, MatchLive, MatchPaid, MatchRefunded, MatchResultReported, ServerCrashed,
    ServerLifecycleEvent, ServerStarted, ServerStopped,
};
pub use topics::TopicConfig;

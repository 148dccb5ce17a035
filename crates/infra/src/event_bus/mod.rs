//! Infrastructure event bus implementations.
//!
//! The bus abstraction lives in `wager-events` as pure mechanics. This module
//! adds the Redis-backed bus and a runtime-selected wrapper so services can
//! be wired to either transport from configuration.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisPubSubEventBus};

use std::sync::Arc;

use wager_events::{EventBus, EventEnvelope, InMemoryEventBus, LifecycleEvent, Subscription};

pub type LifecycleEnvelope = EventEnvelope<LifecycleEvent>;

/// Lifecycle bus chosen at startup.
#[derive(Clone)]
pub enum AnyLifecycleBus {
    InMemory(Arc<InMemoryEventBus<LifecycleEnvelope>>),
    #[cfg(feature = "redis")]
    Redis(Arc<RedisPubSubEventBus>),
}

impl AnyLifecycleBus {
    pub fn in_memory() -> Self {
        AnyLifecycleBus::InMemory(Arc::new(InMemoryEventBus::new()))
    }

    pub fn transport(&self) -> &'static str {
        match self {
            AnyLifecycleBus::InMemory(_) => "in_memory",
            #[cfg(feature = "redis")]
            AnyLifecycleBus::Redis(_) => "redis",
        }
    }
}

impl EventBus<LifecycleEnvelope> for AnyLifecycleBus {
    type Error = String;

    fn publish(&self, message: LifecycleEnvelope) -> Result<(), Self::Error> {
        match self {
            AnyLifecycleBus::InMemory(bus) => bus.publish(message).map_err(|e| format!("{e:?}")),
            #[cfg(feature = "redis")]
            AnyLifecycleBus::Redis(bus) => bus.publish(message).map_err(|e| e.to_string()),
        }
    }

    fn subscribe(&self) -> Subscription<LifecycleEnvelope> {
        match self {
            AnyLifecycleBus::InMemory(bus) => bus.subscribe(),
            #[cfg(feature = "redis")]
            AnyLifecycleBus::Redis(bus) => bus.subscribe(),
        }
    }
}

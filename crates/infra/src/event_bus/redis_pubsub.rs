//! Redis pub/sub bus for lifecycle envelopes.
//!
//! Each envelope is published on the channel named by its topic; a
//! subscription listens on both configured topics. Pub/sub is not durable:
//! messages published while no subscriber is connected are lost.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use thiserror::Error;
use tracing::{debug, warn};

use wager_events::{EventBus, EventEnvelope, LifecycleEvent, Subscription, TopicConfig};

#[derive(Debug, Error)]
pub enum RedisBusError {
    #[error("redis: {0}")]
    Redis(String),

    #[error("serialize: {0}")]
    Serialize(String),

    #[error("unknown topic '{0}'")]
    UnknownTopic(String),
}

#[derive(Debug, Clone)]
pub struct RedisPubSubEventBus {
    client: redis::Client,
    topics: TopicConfig,
}

impl RedisPubSubEventBus {
    pub fn new(redis_url: impl AsRef<str>, topics: TopicConfig) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(Self { client, topics })
    }
}

impl EventBus<EventEnvelope<LifecycleEvent>> for RedisPubSubEventBus {
    type Error = RedisBusError;

    fn publish(&self, message: EventEnvelope<LifecycleEvent>) -> Result<(), Self::Error> {
        if !self.topics.is_known(message.topic()) {
            return Err(RedisBusError::UnknownTopic(message.topic().to_string()));
        }
        let payload =
            serde_json::to_string(&message).map_err(|e| RedisBusError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let receivers: i64 = conn
            .publish(message.topic(), payload)
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        debug!(topic = message.topic(), receivers, "published lifecycle event");

        Ok(())
    }

    fn subscribe(&self) -> Subscription<EventEnvelope<LifecycleEvent>> {
        let (tx, rx) = mpsc::channel();

        let client = self.client.clone();
        let channels = [
            self.topics.match_lifecycle.clone(),
            self.topics.server_lifecycle.clone(),
        ];

        // Forwarder thread; dropping the subscription ends it on the next message.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(err) => {
                    warn!(error = %err, "redis subscription could not connect");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(err) = pubsub.subscribe(&channels[..]) {
                warn!(error = %err, "redis subscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(err) => {
                        warn!(error = %err, "redis subscription closed");
                        return;
                    }
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let envelope: EventEnvelope<LifecycleEvent> = match serde_json::from_str(&payload)
                {
                    Ok(e) => e,
                    Err(err) => {
                        warn!(channel = msg.get_channel_name(), error = %err, "dropping undecodable event");
                        continue;
                    }
                };

                if tx.send(envelope).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}

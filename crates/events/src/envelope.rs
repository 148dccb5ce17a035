use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Event;
use crate::lifecycle::LifecycleEvent;
use crate::topics::TopicConfig;

/// Envelope for an event, carrying transport metadata.
///
/// This is the unit put on a bus. `topic` is resolved from the injected
/// `TopicConfig` at publish time; `subject` is the match the event concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    topic: String,
    subject: String,
    event_type: String,
    event_version: u32,
    published_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        topic: impl Into<String>,
        subject: impl Into<String>,
        event_type: impl Into<String>,
        event_version: u32,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            topic: topic.into(),
            subject: subject.into(),
            event_type: event_type.into(),
            event_version,
            published_at: Utc::now(),
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl EventEnvelope<LifecycleEvent> {
    /// Wrap a lifecycle event, resolving its topic from configuration.
    pub fn lifecycle(topics: &TopicConfig, event: LifecycleEvent) -> Self {
        Self::new(
            Uuid::now_v7(),
            topics.topic_for(&event),
            event.match_id().to_string(),
            event.event_type(),
            event.version(),
            event,
        )
    }
}

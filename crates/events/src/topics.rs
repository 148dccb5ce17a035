//! Topic names are configuration, not code.

use serde::{Deserialize, Serialize};

use crate::lifecycle::LifecycleEvent;

pub const DEFAULT_MATCH_TOPIC: &str = "match.lifecycle";
pub const DEFAULT_SERVER_TOPIC: &str = "server.lifecycle";

/// Topic names injected by the deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub match_lifecycle: String,
    pub server_lifecycle: String,
}

impl TopicConfig {
    /// Topic an event is published on.
    pub fn topic_for(&self, event: &LifecycleEvent) -> &str {
        match event {
            LifecycleEvent::Match(_) => &self.match_lifecycle,
            LifecycleEvent::Server(_) => &self.server_lifecycle,
        }
    }

    /// Whether a topic name belongs to this deployment.
    pub fn is_known(&self, topic: &str) -> bool {
        topic == self.match_lifecycle || topic == self.server_lifecycle
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            match_lifecycle: DEFAULT_MATCH_TOPIC.to_string(),
            server_lifecycle: DEFAULT_SERVER_TOPIC.to_string(),
        }
    }
}

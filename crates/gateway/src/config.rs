//! Gateway configuration document.
//!
//! Loaded from a JSON file at startup. Bind address and port are not part of
//! the document; they come from command-line flags (see `main.rs`).

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::bus::PublishPolicy;
use crate::error::{GatewayError, Result};
use crate::router::TopicRoutes;

/// Default JetStream stream capturing all gateway topics.
pub const DEFAULT_STREAM: &str = "GATEWAY";

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Broker address, e.g. `nats://localhost:4222`.
    pub broker: String,
    /// Coordinator for streams and consumer groups (JetStream domain).
    #[serde(default)]
    pub coordinator: Option<String>,
    /// Stream holding every produced and consumed topic.
    #[serde(default = "default_stream")]
    pub stream: String,
    /// Consumer group name.
    pub group: String,
    pub topics: TopicsConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub hub: HubConfig,
}

fn default_stream() -> String {
    DEFAULT_STREAM.to_string()
}

/// Topics consumed from and produced to the bus.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicsConfig {
    pub consume: Vec<Topic>,
    pub produce: ProduceTopics,
}

/// A named topic, optionally bound to an action.
#[derive(Debug, Clone, Deserialize)]
pub struct Topic {
    pub name: String,
    #[serde(default)]
    pub action: Option<String>,
}

/// Outbound topic selection, either a fixed pair or an action table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProduceTopics {
    Fixed { business: String, lifecycle: String },
    Table(Vec<Topic>),
}

impl ProduceTopics {
    /// Build the router's topic routes.
    pub fn routes(&self) -> TopicRoutes {
        match self {
            ProduceTopics::Fixed {
                business,
                lifecycle,
            } => TopicRoutes::Fixed {
                business: business.clone(),
                lifecycle: lifecycle.clone(),
            },
            ProduceTopics::Table(topics) => TopicRoutes::Table(
                topics
                    .iter()
                    .filter_map(|t| t.action.clone().map(|action| (action, t.name.clone())))
                    .collect::<HashMap<_, _>>(),
            ),
        }
    }

    fn names(&self) -> Vec<String> {
        match self {
            ProduceTopics::Fixed {
                business,
                lifecycle,
            } => vec![business.clone(), lifecycle.clone()],
            ProduceTopics::Table(topics) => topics.iter().map(|t| t.name.clone()).collect(),
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Read deadline, refreshed on every frame and keepalive.
    pub read_timeout_secs: u64,
    /// Upper bound for one hub write into a session.
    pub write_timeout_secs: u64,
    /// Largest accepted inbound frame.
    pub max_frame_bytes: usize,
    /// Outbound frames queued per session before writes block.
    pub outbound_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: 180,
            write_timeout_secs: 10,
            max_frame_bytes: 64 * 1024,
            outbound_buffer: 256,
        }
    }
}

impl SessionConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Server ping period. Must stay below the read deadline.
    pub fn ping_period(&self) -> Duration {
        self.read_timeout() * 9 / 10
    }
}

/// Hub actor settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Capacity of each hub input channel.
    pub channel_capacity: usize,
    /// Publish attempts per outbound message, including the first.
    pub publish_attempts: u32,
    pub publish_backoff_ms: u64,
    pub publish_max_backoff_ms: u64,
    /// Bound on a single publish attempt.
    pub publish_timeout_ms: u64,
    /// Bound on committing one delivery.
    pub commit_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            publish_attempts: 3,
            publish_backoff_ms: 100,
            publish_max_backoff_ms: 2_000,
            publish_timeout_ms: 5_000,
            commit_timeout_ms: 5_000,
        }
    }
}

impl HubConfig {
    pub fn publish_policy(&self) -> PublishPolicy {
        PublishPolicy {
            attempts: self.publish_attempts,
            initial_backoff: Duration::from_millis(self.publish_backoff_ms),
            max_backoff: Duration::from_millis(self.publish_max_backoff_ms),
            timeout: Duration::from_millis(self.publish_timeout_ms),
        }
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

impl GatewayConfig {
    /// Read and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Parse and validate a configuration document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: GatewayConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(GatewayError::InvalidConfig(msg));

        if self.broker.trim().is_empty() {
            return invalid("broker address is empty".to_string());
        }
        if self.group.trim().is_empty() {
            return invalid("consumer group is empty".to_string());
        }
        if self.stream.trim().is_empty() {
            return invalid("stream name is empty".to_string());
        }
        if self.topics.consume.is_empty() {
            return invalid("no topics to consume".to_string());
        }
        if let Some(topic) = self
            .topics
            .consume
            .iter()
            .chain(self.produce_table())
            .find(|t| t.name.trim().is_empty())
        {
            return invalid(format!("empty topic name (action {:?})", topic.action));
        }

        match &self.topics.produce {
            ProduceTopics::Fixed {
                business,
                lifecycle,
            } => {
                if business.trim().is_empty() || lifecycle.trim().is_empty() {
                    return invalid("business and lifecycle topics must be set".to_string());
                }
            }
            ProduceTopics::Table(topics) => {
                if topics.is_empty() {
                    return invalid("produce table is empty".to_string());
                }
                let mut seen = HashSet::new();
                for topic in topics {
                    let Some(action) = topic.action.as_deref() else {
                        return invalid(format!("produce topic {} has no action", topic.name));
                    };
                    if !seen.insert(action) {
                        return invalid(format!("duplicate produce action {}", action));
                    }
                }
            }
        }

        if self.hub.channel_capacity == 0 || self.session.outbound_buffer == 0 {
            return invalid("channel capacities must be non-zero".to_string());
        }
        if self.hub.publish_attempts == 0 {
            return invalid("publish_attempts must be at least 1".to_string());
        }
        if self.session.read_timeout_secs == 0 || self.session.write_timeout_secs == 0 {
            return invalid("session timeouts must be non-zero".to_string());
        }

        Ok(())
    }

    fn produce_table(&self) -> &[Topic] {
        match &self.topics.produce {
            ProduceTopics::Table(topics) => topics,
            ProduceTopics::Fixed { .. } => &[],
        }
    }

    /// Topics the consumer group subscribes to.
    pub fn consume_topics(&self) -> Vec<String> {
        self.topics.consume.iter().map(|t| t.name.clone()).collect()
    }

    /// Every topic the gateway touches, produce topics first.
    pub fn all_topics(&self) -> Vec<String> {
        let mut topics = self.topics.produce.names();
        topics.extend(self.consume_topics());
        topics
    }
}

//! NATS client implementation with JetStream log semantics.

use anyhow::Result;
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy, PullConsumer},
    stream::Stream,
};
use async_nats::ConnectOptions;
use bytes::Bytes;
use std::time::Duration;
use tracing::info;

/// Default retention period for the gateway stream (7 days).
pub const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

/// Default max bytes per stream (1GB).
pub const DEFAULT_MAX_BYTES: i64 = 1_073_741_824;

/// Default time the broker waits for an ack before redelivering.
pub const DEFAULT_ACK_WAIT_SECS: u64 = 30;

/// Continuous delivery sequence of a consumer group.
///
/// Every item must be acked; unacked items are redelivered after the ack wait.
pub type DeliveryStream = pull::Stream;

/// Configuration for creating a stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Stream name.
    pub name: String,
    /// Subjects (topics) captured by the stream.
    pub subjects: Vec<String>,
    /// Retention period in seconds.
    pub max_age_secs: u64,
    /// Maximum bytes.
    pub max_bytes: i64,
}

impl StreamConfig {
    /// Create a stream config capturing the given topics.
    ///
    /// Duplicate topics are collapsed, keeping first-seen order.
    pub fn new(name: &str, topics: impl IntoIterator<Item = String>) -> Self {
        let mut subjects: Vec<String> = Vec::new();
        for topic in topics {
            if !subjects.contains(&topic) {
                subjects.push(topic);
            }
        }

        Self {
            name: name.to_string(),
            subjects,
            max_age_secs: DEFAULT_RETENTION_SECS,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// Configuration for joining a consumer group.
#[derive(Debug, Clone)]
pub struct ConsumerGroupConfig {
    /// Durable group name. Members sharing it share one cursor.
    pub group: String,
    /// Topics consumed by the group.
    pub topics: Vec<String>,
    /// Redelivery timeout for unacked messages.
    pub ack_wait: Duration,
}

impl ConsumerGroupConfig {
    pub fn new(group: &str, topics: Vec<String>) -> Self {
        Self {
            group: group.to_string(),
            topics,
            ack_wait: Duration::from_secs(DEFAULT_ACK_WAIT_SECS),
        }
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }
}

/// Wrapper around the NATS client with JetStream context.
#[derive(Clone)]
pub struct NatsClient {
    jetstream: jetstream::Context,
}

impl NatsClient {
    /// Connect to a NATS server and create a JetStream context.
    ///
    /// `domain` selects the JetStream domain that coordinates streams and
    /// consumer groups; `None` uses the server's default domain.
    pub async fn connect(url: &str, domain: Option<&str>) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = ConnectOptions::new().name("wsapigw").connect(url).await?;
        let jetstream = match domain {
            Some(domain) => {
                info!("Using JetStream domain {}", domain);
                jetstream::with_domain(client, domain)
            }
            None => jetstream::new(client),
        };

        Ok(Self { jetstream })
    }

    /// Create or get a stream with the given configuration.
    pub async fn ensure_stream(&self, config: &StreamConfig) -> Result<Stream> {
        info!(
            "Ensuring stream '{}' exists (subjects: {:?}, retention: {}s)",
            config.name, config.subjects, config.max_age_secs
        );

        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.name.clone(),
                subjects: config.subjects.clone(),
                retention: jetstream::stream::RetentionPolicy::Limits,
                max_bytes: config.max_bytes,
                max_age: Duration::from_secs(config.max_age_secs),
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await?;

        info!("Stream '{}' ready", config.name);
        Ok(stream)
    }

    /// Join (or create) a durable consumer group on `stream`.
    ///
    /// A new group starts from the oldest retained message. Messages must be
    /// acked explicitly.
    pub async fn join_consumer_group(
        &self,
        stream: &Stream,
        config: &ConsumerGroupConfig,
    ) -> Result<DeliveryStream> {
        info!(
            "Joining consumer group '{}' (topics: {:?})",
            config.group, config.topics
        );

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                &config.group,
                pull::Config {
                    durable_name: Some(config.group.clone()),
                    ack_policy: AckPolicy::Explicit,
                    deliver_policy: DeliverPolicy::All,
                    ack_wait: config.ack_wait,
                    filter_subjects: config.topics.clone(),
                    ..Default::default()
                },
            )
            .await?;

        let messages = consumer.messages().await?;

        info!("Joined consumer group '{}'", config.group);
        Ok(messages)
    }

    /// Publish a message to JetStream and wait for the broker ack.
    ///
    /// Returns the stream sequence assigned to the message.
    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<u64> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload)
            .await?
            .await?;
        Ok(ack.sequence)
    }
}

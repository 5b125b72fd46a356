//! Event bus seams: publish, consume, commit.
//!
//! The hub only sees [`EventPublisher`]; the consumer task only sees a stream
//! of [`BusDelivery`] items. The JetStream implementations live here so the
//! rest of the crate can be driven by in-memory fakes.

use anyhow::anyhow;
use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use metrics::counter;
use nats_client::NatsClient;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::hub::HubHandle;

/// Publishes serialized envelopes to a topic.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Resolves once the broker has acknowledged the message.
    async fn publish(&self, topic: &str, payload: Bytes) -> anyhow::Result<()>;
}

/// One item of the consumer group's delivery stream.
#[async_trait]
pub trait BusDelivery: Send + Sync {
    fn topic(&self) -> &str;
    fn payload(&self) -> Bytes;
    /// Advance the group's durable cursor past this item.
    async fn commit(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl EventPublisher for NatsClient {
    async fn publish(&self, topic: &str, payload: Bytes) -> anyhow::Result<()> {
        let sequence = NatsClient::publish(self, topic, payload).await?;
        debug!("Published to {} at sequence {}", topic, sequence);
        Ok(())
    }
}

#[async_trait]
impl BusDelivery for jetstream::Message {
    fn topic(&self) -> &str {
        self.subject.as_str()
    }

    fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    async fn commit(&self) -> anyhow::Result<()> {
        self.ack().await.map_err(|e| anyhow!(e))
    }
}

/// A bus message handed to the hub.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub topic: String,
    pub payload: Bytes,
}

// ============================================================================
// Publishing
// ============================================================================

/// Bounded retry for outbound publishes.
#[derive(Debug, Clone)]
pub struct PublishPolicy {
    /// Attempts including the first one.
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on each attempt.
    pub timeout: Duration,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Publish with per-attempt timeout and exponential backoff.
///
/// Returns the number of attempts used. The total time spent is bounded by
/// `attempts * timeout` plus the backoff delays.
pub async fn publish_with_retry(
    publisher: &dyn EventPublisher,
    topic: &str,
    payload: Bytes,
    policy: &PublishPolicy,
) -> Result<u32> {
    let mut delay = policy.initial_backoff;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match timeout(policy.timeout, publisher.publish(topic, payload.clone())).await {
            Ok(Ok(())) => return Ok(attempt),
            Ok(Err(e)) => GatewayError::Bus(e),
            Err(_) => GatewayError::PublishTimeout {
                topic: topic.to_string(),
                attempts: attempt,
            },
        };

        if attempt >= policy.attempts {
            return Err(err);
        }

        warn!(
            "Publish to {} failed (attempt {}/{}): {}, retrying in {:?}",
            topic, attempt, policy.attempts, err, delay
        );
        sleep(delay).await;

        // Exponential backoff
        delay = (delay * 2).min(policy.max_backoff);
    }
}

// ============================================================================
// Consuming
// ============================================================================

/// Run the process-wide bus consumer.
///
/// Each delivery is handed to the hub and committed afterwards. A delivery
/// that never reached the hub is left uncommitted and will be redelivered.
///
/// Returns `Ok` on shutdown or when the hub is gone, and an error if the
/// delivery stream ends on its own.
pub async fn run_consumer<S, D, E>(
    messages: S,
    hub: HubHandle,
    commit_timeout: Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<D, E>> + Send,
    D: BusDelivery,
    E: Display + Send,
{
    tokio::pin!(messages);
    info!("Bus consumer running");

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                info!("Bus consumer received shutdown signal");
                break;
            }

            next = messages.next() => {
                match next {
                    Some(Ok(delivery)) => {
                        counter!("gateway_bus_received_total").increment(1);
                        let event = BusEvent {
                            topic: delivery.topic().to_string(),
                            payload: delivery.payload(),
                        };
                        if hub.deliver(event).await.is_err() {
                            warn!("Hub closed, stopping bus consumer");
                            break;
                        }
                        commit(&delivery, commit_timeout).await;
                    }
                    Some(Err(e)) => {
                        warn!("Bus delivery error: {}", e);
                        counter!("gateway_bus_errors_total").increment(1);
                    }
                    None => {
                        return Err(GatewayError::Bus(anyhow!(
                            "delivery stream ended unexpectedly"
                        )));
                    }
                }
            }
        }
    }

    info!("Bus consumer stopped");
    Ok(())
}

/// Commit failures are logged only; the item may be redelivered later.
async fn commit<D: BusDelivery>(delivery: &D, commit_timeout: Duration) {
    let failure = match timeout(commit_timeout, delivery.commit()).await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {:?}", commit_timeout),
    };
    warn!("Failed to commit delivery on {}: {}", delivery.topic(), failure);
    counter!("gateway_commit_failures_total").increment(1);
}

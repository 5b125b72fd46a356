//! NATS JetStream client used as a Kafka-style durable log.
//!
//! Topics are subjects captured by a single file-backed stream. A consumer
//! group is a durable pull consumer with an explicit ack policy, so each
//! delivered message must be acked (committed) to advance the group's cursor.

pub mod client;

pub use client::{ConsumerGroupConfig, DeliveryStream, NatsClient, StreamConfig};

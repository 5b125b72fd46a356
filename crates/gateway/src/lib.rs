//! WebSocket ↔ event bus gateway.
//!
//! This service:
//! - Accepts WebSocket connections on one endpoint per client role
//! - Assigns every connection a server-side identity
//! - Publishes client envelopes to the bus, keyed by payload or action
//! - Consumes the bus as a consumer group and routes each event to one
//!   addressed client or to every matching client
//!
//! ## Architecture
//!
//! ```text
//! WebSocket clients (/ra, /fpa, /fpb)
//!         ↕  session tasks
//! Hub (owns ClientRegistry + MessageRouter)
//!         ↕  publish / consumer group
//! NATS JetStream
//! ```
//!
//! All shared mutable state lives in the hub task. Sessions and the bus
//! consumer talk to it over bounded channels.

pub mod bus;
pub mod config;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod ws_server;

#[cfg(test)]
mod test_support;

pub use bus::{publish_with_retry, run_consumer, BusDelivery, BusEvent, EventPublisher, PublishPolicy};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use hub::{Hub, HubHandle, HubSettings, HubStats};
pub use protocol::{Envelope, Payload, Role};
pub use registry::{ClientId, ClientRegistry};
pub use router::{MessageRouter, Recipients, TopicRoutes};
pub use ws_server::{create_router, AppState};

//! The hub actor.
//!
//! One task owns the [`ClientRegistry`] and the [`MessageRouter`] and handles
//! one input at a time. Sessions and the bus consumer reach it only through
//! the bounded channels behind [`HubHandle`], so the registry needs no locks
//! and every register, unregister and broadcast scan is totally ordered.
//!
//! ## Input priority
//!
//! When several inputs are ready at once the hub picks, in order:
//! shutdown, unregister, register, bus deliveries, client messages, stats.
//! Dead sessions are evicted before the next fan-out, and the single bus
//! consumer is never starved by chatty clients. Stats come last, so under
//! sustained traffic a stats request can wait indefinitely; callers bound
//! the wait themselves (see [`HubHandle::stats`]).
//!
//! ## Head-of-line blocking
//!
//! Publishes and session writes are awaited inline. A slow broker or a slow
//! client stalls every other input for up to the publish retry budget or the
//! session write timeout respectively. Both are bounded by configuration.

use axum::extract::ws::Message;
use bytes::Bytes;
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::bus::{publish_with_retry, BusEvent, EventPublisher, PublishPolicy};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, RegistryError, Result};
use crate::protocol::{Envelope, Payload};
use crate::registry::{ClientId, ClientRegistry, Connection};
use crate::router::{MessageRouter, Recipients};

/// Registration request carrying the reply slot for the assigned identity.
pub struct RegisterRequest {
    pub conn: Connection,
    pub reply: oneshot::Sender<std::result::Result<ClientId, RegistryError>>,
}

/// Snapshot of hub state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub clients: usize,
}

/// Receiving ends of the hub's input channels.
pub struct HubInputs {
    pub(crate) register_rx: mpsc::Receiver<RegisterRequest>,
    pub(crate) unregister_rx: mpsc::Receiver<ClientId>,
    pub(crate) inbound_rx: mpsc::Receiver<Envelope>,
    pub(crate) bus_rx: mpsc::Receiver<BusEvent>,
    pub(crate) stats_rx: mpsc::Receiver<oneshot::Sender<HubStats>>,
}

/// Cloneable sending side of the hub.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<RegisterRequest>,
    unregister_tx: mpsc::Sender<ClientId>,
    inbound_tx: mpsc::Sender<Envelope>,
    bus_tx: mpsc::Sender<BusEvent>,
    stats_tx: mpsc::Sender<oneshot::Sender<HubStats>>,
}

impl HubHandle {
    /// Create the hub's input channels, each bounded to `capacity`.
    pub fn channel(capacity: usize) -> (HubHandle, HubInputs) {
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (bus_tx, bus_rx) = mpsc::channel(capacity);
        let (stats_tx, stats_rx) = mpsc::channel(capacity);

        (
            HubHandle {
                register_tx,
                unregister_tx,
                inbound_tx,
                bus_tx,
                stats_tx,
            },
            HubInputs {
                register_rx,
                unregister_rx,
                inbound_rx,
                bus_rx,
                stats_rx,
            },
        )
    }

    /// Register a connection and wait for its identity.
    pub async fn register(&self, conn: Connection) -> Result<ClientId> {
        let (reply, rx) = oneshot::channel();
        self.register_tx.send(RegisterRequest { conn, reply }).await?;
        let id = rx.await.map_err(|_| GatewayError::HubClosed)??;
        Ok(id)
    }

    /// Ask the hub to drop a connection. Unknown identities are ignored.
    pub async fn unregister(&self, id: ClientId) -> Result<()> {
        self.unregister_tx.send(id).await?;
        Ok(())
    }

    /// Submit a client envelope for publishing. Waits while the hub is full.
    pub async fn submit(&self, envelope: Envelope) -> Result<()> {
        self.inbound_tx.send(envelope).await?;
        Ok(())
    }

    /// Hand a bus message to the hub for delivery.
    pub async fn deliver(&self, event: BusEvent) -> Result<()> {
        self.bus_tx.send(event).await?;
        Ok(())
    }

    /// Current hub state, answered after all earlier queued inputs.
    ///
    /// Lowest hub priority. Wrap in a timeout when the answer is needed
    /// promptly.
    pub async fn stats(&self) -> Result<HubStats> {
        let (reply, rx) = oneshot::channel();
        self.stats_tx.send(reply).await?;
        rx.await.map_err(|_| GatewayError::HubClosed)
    }
}

/// Hub tuning knobs.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub publish_policy: PublishPolicy,
    /// Bound on one write into one session.
    pub write_timeout: Duration,
}

impl HubSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            publish_policy: config.hub.publish_policy(),
            write_timeout: config.session.write_timeout(),
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            publish_policy: PublishPolicy::default(),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Serialized control loop owning all shared mutable state.
pub struct Hub {
    registry: ClientRegistry,
    router: MessageRouter,
    publisher: Arc<dyn EventPublisher>,
    settings: HubSettings,
    inputs: HubInputs,
}

impl Hub {
    pub fn new(
        router: MessageRouter,
        publisher: Arc<dyn EventPublisher>,
        settings: HubSettings,
        inputs: HubInputs,
    ) -> Self {
        Self {
            registry: ClientRegistry::new(),
            router,
            publisher,
            settings,
            inputs,
        }
    }

    /// Replace the (empty) registry, e.g. to control identity generation.
    pub fn with_registry(mut self, registry: ClientRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Run the hub until shutdown is signalled or its sender is dropped.
    pub async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!("Hub running");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Hub received shutdown signal");
                    break;
                }

                Some(id) = self.inputs.unregister_rx.recv() => {
                    self.handle_unregister(&id);
                }

                Some(req) = self.inputs.register_rx.recv() => {
                    self.handle_register(req);
                }

                Some(event) = self.inputs.bus_rx.recv() => {
                    self.handle_bus_event(event).await;
                }

                Some(envelope) = self.inputs.inbound_rx.recv() => {
                    self.handle_client_message(envelope).await;
                }

                Some(reply) = self.inputs.stats_rx.recv() => {
                    let _ = reply.send(HubStats {
                        clients: self.registry.client_count(),
                    });
                }
            }
        }

        // Close every remaining socket.
        let ids: Vec<ClientId> = self.registry.iter().map(|s| s.id).collect();
        for id in ids {
            self.registry.unregister(&id);
        }
        gauge!("gateway_active_connections").set(0.0);
        info!("Hub stopped");
    }

    fn handle_register(&mut self, req: RegisterRequest) {
        let result = self.registry.register(req.conn);
        match &result {
            Ok(_) => counter!("gateway_connections_total").increment(1),
            Err(e) => {
                error!("Rejecting connection: {}", e);
                counter!("gateway_rejected_connections_total").increment(1);
            }
        }

        // The session gave up waiting; don't keep an entry nobody will remove.
        if let Err(Ok(id)) = req.reply.send(result) {
            debug!("Client {} left before registration completed", id);
            self.registry.unregister(&id);
        }
        self.update_gauge();
    }

    fn handle_unregister(&mut self, id: &ClientId) {
        if self.registry.unregister(id).is_some() {
            counter!("gateway_disconnections_total").increment(1);
            self.update_gauge();
        }
    }

    /// Client → bus.
    async fn handle_client_message(&mut self, envelope: Envelope) {
        let topic = match self.router.outbound_topic(&envelope) {
            Ok(topic) => topic.to_string(),
            Err(e) => {
                warn!("Dropping message from {:?}: {}", envelope.cid, e);
                counter!("gateway_dropped_messages_total", "reason" => "unrouted").increment(1);
                return;
            }
        };

        let payload = match serde_json::to_vec(&envelope) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!("Failed to serialize message from {:?}: {}", envelope.cid, e);
                counter!("gateway_dropped_messages_total", "reason" => "serialize").increment(1);
                return;
            }
        };

        match publish_with_retry(
            self.publisher.as_ref(),
            &topic,
            payload,
            &self.settings.publish_policy,
        )
        .await
        {
            Ok(attempts) => {
                debug!(
                    "Published message from {:?} to {} ({} attempt(s))",
                    envelope.cid, topic, attempts
                );
                counter!("gateway_published_total").increment(1);
            }
            Err(e) => {
                error!(
                    "Dropping message from {:?} to {} after retries: {}",
                    envelope.cid, topic, e
                );
                counter!("gateway_publish_failures_total").increment(1);
                counter!("gateway_dropped_messages_total", "reason" => "publish").increment(1);
            }
        }
    }

    /// Bus → clients.
    async fn handle_bus_event(&mut self, event: BusEvent) {
        let envelope = match Envelope::from_frame(&event.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed message from {}: {}", event.topic, e);
                counter!("gateway_dropped_messages_total", "reason" => "malformed").increment(1);
                return;
            }
        };

        let recipients = self.router.recipients(&envelope, &self.registry);
        if recipients.is_empty() {
            debug!("No clients match message from {}", event.topic);
            return;
        }

        debug!(
            "Routing {} message from {} to {} client(s)",
            envelope.payload.as_ref().map_or("bare", Payload::tag),
            event.topic,
            recipients.len()
        );

        // Forward the exact bytes received from the bus.
        let frame = match std::str::from_utf8(&event.payload) {
            Ok(text) => Message::Text(text.into()),
            Err(_) => Message::Binary(event.payload.clone()),
        };

        let ids = match recipients {
            Recipients::Unicast(id) => vec![id],
            Recipients::FanOut(ids) => ids,
        };
        self.write_all(&ids, frame).await;
    }

    /// Write `frame` to each session. Failed sessions are closed and removed
    /// after the scan; one failure never stops delivery to the rest.
    async fn write_all(&mut self, ids: &[ClientId], frame: Message) {
        let mut failed = Vec::new();

        for id in ids {
            let Some(session) = self.registry.get(id) else {
                continue;
            };
            match session
                .write(frame.clone(), self.settings.write_timeout)
                .await
            {
                Ok(()) => {
                    counter!("gateway_deliveries_total").increment(1);
                }
                Err(e) => {
                    warn!("Write to client {} failed: {}", id, e);
                    session.close();
                    failed.push(*id);
                }
            }
        }

        for id in failed {
            self.handle_unregister(&id);
        }
    }

    fn update_gauge(&self) {
        gauge!("gateway_active_connections").set(self.registry.client_count() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;
    use crate::router::TopicRoutes;
    use crate::test_support::FlakyPublisher;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct TestHub {
        handle: HubHandle,
        publisher: Arc<FlakyPublisher>,
        _shutdown_tx: mpsc::Sender<()>,
        task: JoinHandle<()>,
    }

    struct TestClient {
        id: ClientId,
        rx: mpsc::Receiver<Message>,
        closed: CancellationToken,
    }

    fn settings() -> HubSettings {
        HubSettings {
            publish_policy: PublishPolicy {
                attempts: 2,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(10),
                timeout: Duration::from_secs(1),
            },
            write_timeout: Duration::from_millis(200),
        }
    }

    fn start(publisher: FlakyPublisher, registry: ClientRegistry) -> TestHub {
        let publisher = Arc::new(publisher);
        let (handle, inputs) = HubHandle::channel(16);
        let router = MessageRouter::new(TopicRoutes::Fixed {
            business: "ledger.in".to_string(),
            lifecycle: "presence".to_string(),
        });
        let hub = Hub::new(router, publisher.clone(), settings(), inputs).with_registry(registry);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(hub.run(shutdown_rx));

        TestHub {
            handle,
            publisher,
            _shutdown_tx: shutdown_tx,
            task,
        }
    }

    fn start_default() -> TestHub {
        start(FlakyPublisher::reliable(), ClientRegistry::new())
    }

    async fn connect(hub: &TestHub, role: Role, buffer: usize) -> TestClient {
        let (tx, rx) = mpsc::channel(buffer);
        let closed = CancellationToken::new();
        let id = hub
            .handle
            .register(Connection {
                role,
                tx,
                closed: closed.clone(),
            })
            .await
            .unwrap();
        TestClient { id, rx, closed }
    }

    async fn deliver(hub: &TestHub, payload: &str) {
        hub.handle
            .deliver(BusEvent {
                topic: "ledger.out".to_string(),
                payload: Bytes::from(payload.to_string()),
            })
            .await
            .unwrap();
        // Stats are answered only once earlier inputs are handled.
        hub.handle.stats().await.unwrap();
    }

    async fn received(client: &mut TestClient) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(msg) = client.rx.try_recv() {
            match msg {
                Message::Text(text) => frames.push(text.as_str().to_string()),
                other => panic!("unexpected frame {:?}", other),
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_bare_envelope_goes_to_lifecycle_topic() {
        let hub = start_default();
        let client = connect(&hub, Role::Fpa, 4).await;

        let mut envelope = Envelope {
            kind: Some(String::new()),
            ..Default::default()
        };
        envelope.stamp(client.id);
        hub.handle.submit(envelope).await.unwrap();
        hub.handle.stats().await.unwrap();

        let published = hub.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "presence");
        let sent: Envelope = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(sent.recipient(), Some(client.id));
    }

    #[tokio::test]
    async fn test_payload_envelope_goes_to_business_topic() {
        let hub = start_default();
        let envelope: Envelope =
            serde_json::from_str(r#"{"Payload":{"ChangeFPReq":{"EmpID":"e-1"}}}"#).unwrap();
        hub.handle.submit(envelope).await.unwrap();
        hub.handle.stats().await.unwrap();

        let published = hub.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "ledger.in");
        assert!(String::from_utf8_lossy(&published[0].1).contains(r#""EmpID":"e-1""#));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_is_retried_then_dropped() {
        // 2 attempts per message: the first message exhausts its budget,
        // the second fails once and then succeeds.
        let hub = start(FlakyPublisher::failing(3), ClientRegistry::new());

        for name in ["first", "second"] {
            let envelope = Envelope {
                username: Some(name.to_string()),
                ..Default::default()
            };
            hub.handle.submit(envelope).await.unwrap();
        }
        assert_eq!(hub.handle.stats().await.unwrap().clients, 0);

        let published = hub.publisher.published();
        assert_eq!(published.len(), 1);
        assert!(String::from_utf8_lossy(&published[0].1).contains("second"));
    }

    #[tokio::test]
    async fn test_unicast_precedence() {
        let hub = start_default();
        let mut target = connect(&hub, Role::Fpa, 4).await;
        let mut other = connect(&hub, Role::Fpa, 4).await;

        let payload = format!(r#"{{"CID":"{}","Type":"FPA"}}"#, target.id);
        deliver(&hub, &payload).await;

        assert_eq!(received(&mut target).await, vec![payload]);
        assert!(received(&mut other).await.is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_completeness() {
        let hub = start_default();
        let mut a1 = connect(&hub, Role::Fpa, 4).await;
        let mut b = connect(&hub, Role::Fpb, 4).await;
        let mut a2 = connect(&hub, Role::Fpa, 4).await;

        let payload = format!(r#"{{"CID":"{}","Type":"FPA"}}"#, Uuid::new_v4());
        deliver(&hub, &payload).await;

        assert_eq!(received(&mut a1).await.len(), 1);
        assert_eq!(received(&mut a2).await.len(), 1);
        assert!(received(&mut b).await.is_empty());
    }

    #[tokio::test]
    async fn test_fault_isolation() {
        let hub = start_default();
        let broken = connect(&hub, Role::Fpa, 4).await;
        let mut healthy = connect(&hub, Role::Fpa, 4).await;
        let broken_id = broken.id;
        let broken_closed = broken.closed.clone();
        drop(broken.rx);

        deliver(&hub, r#"{"Type":"FPA"}"#).await;

        assert_eq!(received(&mut healthy).await, vec![r#"{"Type":"FPA"}"#]);
        assert!(broken_closed.is_cancelled());
        assert_eq!(hub.handle.stats().await.unwrap().clients, 1);

        // Session teardown still sends its own unregister; it is a no-op now.
        hub.handle.unregister(broken_id).await.unwrap();
        assert_eq!(hub.handle.stats().await.unwrap().clients, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_client_stalls_hub_for_write_timeout_only() {
        let hub = start_default();
        // Buffer of one, never drained.
        let slow = connect(&hub, Role::Ra, 1).await;
        let mut fast = connect(&hub, Role::Ra, 8).await;

        let started = tokio::time::Instant::now();
        deliver(&hub, r#"{"Payload":{"Block":"1"}}"#).await;
        deliver(&hub, r#"{"Payload":{"Block":"2"}}"#).await;

        assert!(started.elapsed() >= settings().write_timeout);
        assert!(slow.closed.is_cancelled());
        assert_eq!(received(&mut fast).await.len(), 2);
        assert_eq!(hub.handle.stats().await.unwrap().clients, 1);
    }

    #[tokio::test]
    async fn test_block_broadcast_reaches_everyone() {
        let hub = start_default();
        let mut clients = vec![
            connect(&hub, Role::Ra, 4).await,
            connect(&hub, Role::Fpa, 4).await,
            connect(&hub, Role::Fpb, 4).await,
        ];

        deliver(&hub, r#"{"Payload":{"Block":"halt"}}"#).await;

        for client in clients.iter_mut() {
            assert_eq!(
                received(client).await,
                vec![r#"{"Payload":{"Block":"halt"}}"#]
            );
        }
    }

    #[tokio::test]
    async fn test_malformed_bus_message_is_dropped() {
        let hub = start_default();
        let mut client = connect(&hub, Role::Ra, 4).await;

        deliver(&hub, "not json").await;
        deliver(&hub, r#"{"Payload":{"Block":"a","Employees":[]}}"#).await;
        deliver(&hub, r#"{"Type":"RA"}"#).await;

        assert_eq!(received(&mut client).await, vec![r#"{"Type":"RA"}"#]);
    }

    #[tokio::test]
    async fn test_identity_failure_rejects_one_connection() {
        let fixed = Uuid::new_v4();
        let hub = start(
            FlakyPublisher::reliable(),
            ClientRegistry::with_id_source(Box::new(move || fixed)),
        );
        let first = connect(&hub, Role::Ra, 4).await;
        assert_eq!(first.id, fixed);

        let (tx, _rx) = mpsc::channel(4);
        let result = hub
            .handle
            .register(Connection {
                role: Role::Fpa,
                tx,
                closed: CancellationToken::new(),
            })
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::Registry(RegistryError::IdentityExhausted(_)))
        ));

        // The hub keeps serving.
        assert_eq!(hub.handle.stats().await.unwrap().clients, 1);
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_noop() {
        let hub = start_default();
        let _client = connect(&hub, Role::Ra, 4).await;

        hub.handle.unregister(Uuid::new_v4()).await.unwrap();
        assert_eq!(hub.handle.stats().await.unwrap().clients, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let hub = start_default();
        let client = connect(&hub, Role::Fpb, 4).await;

        drop(hub._shutdown_tx);
        timeout(Duration::from_secs(1), hub.task)
            .await
            .unwrap()
            .unwrap();
        assert!(client.closed.is_cancelled());
    }
}

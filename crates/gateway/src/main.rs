//! Gateway service entry point.
//!
//! WebSocket gateway between role-bound clients and the event bus.

use anyhow::{Context, Result};
use clap::Parser;
use gateway::{
    create_router, run_consumer, AppState, GatewayConfig, Hub, HubHandle, HubSettings,
    MessageRouter,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use nats_client::{ConsumerGroupConfig, NatsClient, StreamConfig};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// WebSocket API gateway for the event bus.
#[derive(Debug, Parser)]
#[command(name = "wsapigw", version, about)]
struct Args {
    /// Address to bind the HTTP/WebSocket server to.
    #[arg(long, env = "GATEWAY_IP", default_value = "0.0.0.0")]
    ip: IpAddr,

    /// Port to bind the HTTP/WebSocket server to.
    #[arg(long, env = "GATEWAY_PORT", default_value_t = 3000)]
    port: u16,

    /// Path to the JSON configuration document.
    #[arg(long, env = "GATEWAY_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Port for the Prometheus exporter.
    #[arg(long, env = "METRICS_PORT", default_value_t = 9093)]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("Starting Gateway service");

    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    info!("Configuration:");
    info!("  BIND: {}:{}", args.ip, args.port);
    info!("  METRICS_PORT: {}", args.metrics_port);
    info!("  BROKER: {}", config.broker);
    info!("  COORDINATOR: {:?}", config.coordinator);
    info!("  GROUP: {}", config.group);
    info!("  CONSUME: {:?}", config.consume_topics());

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], args.metrics_port))
        .install()
        .context("Failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", args.metrics_port);

    // Connect to NATS
    info!("Connecting to NATS at {}", config.broker);
    let nats_client = NatsClient::connect(&config.broker, config.coordinator.as_deref()).await?;
    let nats_client = Arc::new(nats_client);
    info!("Connected to NATS");

    let stream = nats_client
        .ensure_stream(&StreamConfig::new(&config.stream, config.all_topics()))
        .await?;
    let deliveries = nats_client
        .join_consumer_group(
            &stream,
            &ConsumerGroupConfig::new(&config.group, config.consume_topics()),
        )
        .await?;
    info!("Joined consumer group {}", config.group);

    // Create hub
    let (hub_handle, hub_inputs) = HubHandle::channel(config.hub.channel_capacity);
    let hub = Hub::new(
        MessageRouter::new(config.topics.produce.routes()),
        nats_client.clone(),
        HubSettings::from_config(&config),
        hub_inputs,
    );

    // Create shutdown channels for hub and consumer
    let (hub_shutdown_tx, hub_shutdown_rx) = mpsc::channel(1);
    let (consumer_shutdown_tx, consumer_shutdown_rx) = mpsc::channel(1);

    let hub_task = tokio::spawn(hub.run(hub_shutdown_rx));

    let consumer_hub = hub_handle.clone();
    let commit_timeout = config.hub.commit_timeout();
    let consumer_task = tokio::spawn(async move {
        if let Err(e) =
            run_consumer(deliveries, consumer_hub, commit_timeout, consumer_shutdown_rx).await
        {
            error!("Bus consumer error: {:?}", e);
        }
    });

    // Create application state
    let state = Arc::new(AppState {
        hub: hub_handle,
        session: config.session.clone(),
    });

    // Create HTTP router
    let app = create_router(state);

    // Start HTTP server
    let addr = SocketAddr::new(args.ip, args.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Gateway listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the consumer first so nothing is handed to a stopped hub
    info!("Shutting down bus consumer...");
    let _ = consumer_shutdown_tx.send(()).await;
    let _ = consumer_task.await;

    info!("Shutting down hub...");
    let _ = hub_shutdown_tx.send(()).await;
    let _ = hub_task.await;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}

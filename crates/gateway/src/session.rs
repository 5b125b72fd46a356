//! Per-connection tasks.
//!
//! Each WebSocket gets a writer task, which drains the outbound queue the hub
//! writes into, and a read loop, which stamps client frames with the
//! connection's identity and submits them to the hub. Either side ending
//! cancels the connection's token, which ends the other.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::hub::HubHandle;
use crate::protocol::{Envelope, Role};
use crate::registry::{ClientId, Connection};

/// Parse a client frame and overwrite its identity field.
///
/// Whatever `CID` the client sent is discarded.
pub fn prepare_inbound(frame: &[u8], id: ClientId) -> serde_json::Result<Envelope> {
    let mut envelope = Envelope::from_frame(frame)?;
    envelope.stamp(id);
    Ok(envelope)
}

/// Serve one WebSocket connection bound to `role` until it closes.
pub async fn handle_socket(socket: WebSocket, role: Role, hub: HubHandle, config: SessionConfig) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(config.outbound_buffer);
    let closed = CancellationToken::new();

    let client_id = match hub
        .register(Connection {
            role,
            tx: tx.clone(),
            closed: closed.clone(),
        })
        .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!("Refusing {} connection: {}", role, e);
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    info!("Client {} connected on {}", client_id, role.path());

    // Forward queued frames to the socket.
    let writer_closed = closed.clone();
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = writer_closed.cancelled() => break,

                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(e) = ws_tx.send(msg).await {
                        debug!("Socket write failed: {}", e);
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
        writer_closed.cancel();
    });

    let read_timeout = config.read_timeout();
    let mut deadline = Instant::now() + read_timeout;

    // Ping interval for keepalive
    let ping_period = config.ping_period();
    let mut ping_interval = interval_at(Instant::now() + ping_period, ping_period);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = closed.cancelled() => {
                debug!("Client {} closed by hub", client_id);
                break;
            }

            _ = sleep_until(deadline) => {
                info!("Client {} missed read deadline", client_id);
                break;
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", client_id, e);
                        break;
                    }
                    None => break,
                };
                deadline = Instant::now() + read_timeout;

                match msg {
                    Message::Text(text) => submit(&hub, text.as_str().as_bytes(), client_id).await,
                    Message::Binary(data) => submit(&hub, &data, client_id).await,
                    Message::Ping(data) => {
                        // Dropped if the queue is full; the client will ping again.
                        let _ = tx.try_send(Message::Pong(data));
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            }

            _ = ping_interval.tick() => {
                if tx.try_send(Message::Ping(Default::default())).is_err() {
                    debug!("Outbound queue full, skipping ping to {}", client_id);
                }
            }
        }
    }

    // Cleanup
    closed.cancel();
    if hub.unregister(client_id).await.is_err() {
        debug!("Hub gone while unregistering {}", client_id);
    }
    let _ = send_task.await;

    info!("Client {} disconnected", client_id);
}

async fn submit(hub: &HubHandle, frame: &[u8], client_id: ClientId) {
    match prepare_inbound(frame, client_id) {
        Ok(envelope) => {
            counter!("gateway_client_messages_total").increment(1);
            if hub.submit(envelope).await.is_err() {
                warn!("Hub gone, dropping message from {}", client_id);
            }
        }
        Err(e) => {
            warn!("Dropping malformed frame from {}: {}", client_id, e);
            counter!("gateway_dropped_messages_total", "reason" => "malformed").increment(1);
        }
    }
}

//! Connection registry.
//!
//! The registry is a plain `HashMap` owned by the hub actor. It is never
//! shared: every register, unregister, lookup and scan runs on the hub task,
//! so a broadcast scan always sees one consistent snapshot.

use axum::extract::ws::Message;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{RegistryError, WriteError};
use crate::protocol::Role;

/// Unique client identifier.
pub type ClientId = Uuid;

/// Fresh identities tried before a registration is rejected.
pub const MAX_ID_ATTEMPTS: usize = 8;

/// Source of candidate identities.
pub type IdSource = Box<dyn FnMut() -> ClientId + Send + Sync>;

/// What a connection hands to the hub when it asks to be registered.
#[derive(Debug)]
pub struct Connection {
    /// Role bound by the endpoint the client connected to.
    pub role: Role,
    /// Outbound frame queue drained by the connection's writer task.
    pub tx: mpsc::Sender<Message>,
    /// Cancelled when the socket must close.
    pub closed: CancellationToken,
}

/// A registered connection.
#[derive(Debug)]
pub struct Session {
    pub id: ClientId,
    pub role: Role,
    /// Timestamp (ms) of registration.
    pub connected_at: i64,
    tx: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl Session {
    /// Queue one frame for the socket, waiting at most `timeout`.
    ///
    /// The hub awaits this inline, so `timeout` bounds how long one slow
    /// client can stall every other session.
    pub async fn write(&self, frame: Message, timeout: Duration) -> Result<(), WriteError> {
        if self.closed.is_cancelled() {
            return Err(WriteError::Closed);
        }
        self.tx
            .send_timeout(frame, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => WriteError::Timeout,
                SendTimeoutError::Closed(_) => WriteError::Closed,
            })
    }

    /// Milliseconds since registration.
    pub fn age_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.connected_at
    }

    /// Ask the connection's tasks to close the socket.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// Registry of connected clients, keyed by server-assigned identity.
pub struct ClientRegistry {
    clients: HashMap<ClientId, Session>,
    id_source: IdSource,
}

impl ClientRegistry {
    /// Create a new empty registry issuing random v4 identities.
    pub fn new() -> Self {
        Self::with_id_source(Box::new(Uuid::new_v4))
    }

    /// Create a registry drawing identities from `id_source`.
    pub fn with_id_source(id_source: IdSource) -> Self {
        Self {
            clients: HashMap::new(),
            id_source,
        }
    }

    /// Register a connection under a fresh identity.
    ///
    /// Candidates already in use are skipped. If no unused identity turns up
    /// within [`MAX_ID_ATTEMPTS`], only this registration fails.
    pub fn register(&mut self, conn: Connection) -> Result<ClientId, RegistryError> {
        let id = (0..MAX_ID_ATTEMPTS)
            .map(|_| (self.id_source)())
            .find(|candidate| !self.clients.contains_key(candidate))
            .ok_or(RegistryError::IdentityExhausted(MAX_ID_ATTEMPTS))?;

        self.clients.insert(
            id,
            Session {
                id,
                role: conn.role,
                connected_at: Utc::now().timestamp_millis(),
                tx: conn.tx,
                closed: conn.closed,
            },
        );
        info!("Client {} registered as {}", id, conn.role);
        Ok(id)
    }

    /// Remove a client and close its socket.
    ///
    /// Removing an absent identity is a no-op.
    pub fn unregister(&mut self, client_id: &ClientId) -> Option<Session> {
        match self.clients.remove(client_id) {
            Some(session) => {
                session.close();
                info!(
                    "Client {} ({}) unregistered after {}ms",
                    client_id,
                    session.role,
                    session.age_ms()
                );
                Some(session)
            }
            None => {
                debug!("Client {} already unregistered", client_id);
                None
            }
        }
    }

    /// Get a client by ID.
    pub fn get(&self, client_id: &ClientId) -> Option<&Session> {
        self.clients.get(client_id)
    }

    /// All registered sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.clients.values()
    }

    /// Get the total number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

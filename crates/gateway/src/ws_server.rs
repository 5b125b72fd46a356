//! WebSocket server handler using Axum.

use axum::{
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::config::SessionConfig;
use crate::hub::HubHandle;
use crate::protocol::Role;
use crate::session::handle_socket;

/// Longest `/health` waits for the hub before reporting unavailable.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared application state.
pub struct AppState {
    pub hub: HubHandle,
    pub session: SessionConfig,
}

/// Create the HTTP router: one upgrade endpoint per role plus `/health`.
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new().route("/health", get(health_handler));

    for role in Role::ALL {
        router = router.route(
            role.path(),
            get(move |ws: WebSocketUpgrade, State(state): State<Arc<AppState>>| {
                ws_handler(ws, role, state)
            }),
        );
    }

    router.with_state(state).layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let stats = match timeout(HEALTH_TIMEOUT, state.hub.stats()).await {
        Ok(Ok(stats)) => stats,
        Ok(Err(e)) => {
            warn!("Health check failed: {}", e);
            return unavailable();
        }
        Err(_) => {
            warn!("Health check timed out after {:?}", HEALTH_TIMEOUT);
            return unavailable();
        }
    };
    format!(r#"{{"status":"ok","clients":{}}}"#, stats.clients).into_response()
}

fn unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        r#"{"status":"unavailable"}"#.to_string(),
    )
        .into_response()
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, role: Role, state: Arc<AppState>) -> impl IntoResponse {
    let hub = state.hub.clone();
    let session = state.session.clone();
    ws.max_message_size(session.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, role, hub, session))
}

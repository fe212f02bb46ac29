//! Builds the hub's `axum` router: the `/ws` upgrade (gated by an
//! optional bearer token) and a plain `/healthz`.
//!
//! Grounded on `services/server/src/ws_forwarder.rs`'s upgrade handler
//! shape — read the `Authorization` header before upgrading, reject
//! with an error rather than upgrading and then closing.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use echonet_engine::Engine;
use echonet_registry::Registry;
use echonet_transport::Transport;

use crate::auth;
use crate::connection::handle_socket;

pub struct HubState<T: Transport> {
    pub engine: Arc<Engine<T>>,
    pub registry: Arc<Registry>,
    /// `None` disables the bearer-token gate entirely.
    pub auth_token: Option<String>,
}

impl<T: Transport> Clone for HubState<T> {
    fn clone(&self) -> Self {
        HubState {
            engine: self.engine.clone(),
            registry: self.registry.clone(),
            auth_token: self.auth_token.clone(),
        }
    }
}

pub fn router<T: Transport>(state: HubState<T>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler::<T>))
        .route("/healthz", get(healthz::<T>))
        .with_state(state)
}

async fn healthz<T: Transport>(State(state): State<HubState<T>>) -> Response {
    if state.engine.is_transport_listening() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no transport listening").into_response()
    }
}

async fn ws_handler<T: Transport>(
    ws: WebSocketUpgrade,
    State(state): State<HubState<T>>,
    headers: HeaderMap,
) -> Response {
    if let Some(expected) = &state.auth_token {
        let presented = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(auth::extract_bearer);
        match presented {
            Some(token) if auth::tokens_match(expected, token) => {}
            _ => return StatusCode::UNAUTHORIZED.into_response(),
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

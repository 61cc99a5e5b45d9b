//! Stand-alone signaling relay for convoy deployments.
//!
//! Peers connect over WebSocket with a bearer token, land in the directory
//! under their authenticated id, and exchange addressed envelopes under a
//! strict routing policy. Routing is stateless per message; the only state
//! is the directory and each link's partner.

pub mod auth;
pub mod config;
pub mod directory;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::directory::Directory;
use crate::ws::{ws_handler, RelayState};

async fn health_check() -> &'static str {
    "ok"
}

pub fn build_state(config: &Config) -> RelayState {
    RelayState {
        directory: Arc::new(Directory::new(config.duplicate_policy)),
        jwt_secret: Arc::new(config.jwt_secret.clone()),
    }
}

pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

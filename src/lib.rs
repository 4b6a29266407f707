//! Horizontally scalable real-time chat delivery plane.
//!
//! Clients hold one authenticated WebSocket to one instance and exchange
//! frames inside rooms. Every instance can serve any client: local
//! delivery goes through the per-instance [`ws::Hub`], cross-instance
//! delivery through the [`cluster`] bridge over a pub/sub fabric.
//! Durable storage and identity are external collaborators behind the
//! traits in [`repo`] and [`auth`].

pub mod api;
pub mod auth;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod protocol;
pub mod repo;
pub mod ws;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use auth::TokenVerifier;
use config::DeliveryConfig;
use repo::{MembershipRepo, MessageRepo, PushSink, UserRepo};
use ws::Hub;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub users: Arc<dyn UserRepo>,
    pub members: Arc<dyn MembershipRepo>,
    pub messages: Arc<dyn MessageRepo>,
    pub push: Arc<dyn PushSink>,
    pub config: DeliveryConfig,
}

async fn health_check() -> &'static str {
    "OK"
}

/// Builds the full router: health, the socket endpoint, and the backfill
/// route.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws::session::ws_handler))
        .merge(api::router())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

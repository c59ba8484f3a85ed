//! API Module
//!
//! HTTP surface of the orchestrator: the GitHub webhook receiver and a
//! health check.

pub mod error;
pub mod health;
pub mod webhook;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::dispatch::Dispatcher;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
        }
    }
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/github", post(webhook::receive_webhook))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

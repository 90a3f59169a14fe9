//! HTTP API application wiring (Axum router + handler wiring).
//!
//! - `routes.rs`: HTTP handlers for the operator surface
//! - `dto.rs`: response DTOs and JSON mapping
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;

use relaykit_store::OutboxStore;

pub mod dto;
pub mod errors;
pub mod routes;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn OutboxStore>,
    pub table: String,
}

/// Build the full HTTP router (public entrypoint used by `main.rs` and
/// the black-box tests).
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/outbox/dead", get(routes::list_dead))
        .route("/outbox/:id/retry", post(routes::retry_one))
        .route("/outbox/replay", post(routes::replay_by_biz_key))
        .layer(ServiceBuilder::new())
        .with_state(state)
}

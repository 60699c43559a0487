//! API route modules.

pub mod events;
pub mod executions;
pub mod health;
pub mod logging;
pub mod triggers;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/triggers", triggers::router())
        .nest("/api/executions", executions::router())
        .nest("/api/events", events::router())
        .nest("/api/logging", logging::router())
        .nest("/health", health::router())
        .with_state(state)
}

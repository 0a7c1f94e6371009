//! API route handlers for the dashboard server.

pub mod control;
pub mod health;
pub mod projects;
pub mod ws;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Create the combined API router with all routes under /api prefix.
///
/// Routes:
/// - GET    /api/health - Health check
/// - GET    /api/projects - List projects with status
/// - POST   /api/projects - Register a project directory
/// - DELETE /api/projects/{id} - Remove a registration
/// - GET    /api/projects/{id}/notifications - Notification history
/// - POST   /api/projects/{id}/start|stop|pause|resume|inject - Loop control
/// - GET    /api/projects/{id}/config - Read loop config
/// - PUT    /api/projects/{id}/config - Write loop config
/// - GET    /api/ws - Realtime event stream (WebSocket)
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", health::router())
        .nest("/api", projects::router())
        .nest("/api", control::router())
        .nest("/api", ws::router())
        .with_state(state)
}

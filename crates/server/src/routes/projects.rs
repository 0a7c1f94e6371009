//! Project listing, registration, iteration and notification history.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use ralph_dashboard_core::iterations::{list_iterations, IterationSummary};
use ralph_dashboard_core::notification::{notification_history, NotificationEntry};
use ralph_dashboard_core::{build_project_summary, ProjectPaths, ProjectSummary};

use crate::auth::Authenticated;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub path: PathBuf,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct UnregisterResponse {
    pub removed: bool,
}

/// GET /api/projects - Every discovered or registered project with status.
pub async fn list_projects(State(state): State<Arc<AppState>>) -> Json<Vec<ProjectSummary>> {
    Json(state.registry.summaries().await)
}

/// POST /api/projects - Register a project directory outside the scan roots.
pub async fn register_project(
    State(state): State<Arc<AppState>>,
    _auth: Authenticated,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<ProjectSummary>)> {
    let root = state.registry.register(&body.path).await?;
    state.monitor.refresh().await;
    let summary = tokio::task::spawn_blocking(move || build_project_summary(&root))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((StatusCode::CREATED, Json(summary)))
}

/// DELETE /api/projects/{id} - Drop an explicit registration.
pub async fn unregister_project(
    State(state): State<Arc<AppState>>,
    _auth: Authenticated,
    Path(project_id): Path<String>,
) -> ApiResult<Json<UnregisterResponse>> {
    let removed = state.registry.unregister(&project_id).await?;
    if removed {
        state.monitor.refresh().await;
    }
    Ok(Json(UnregisterResponse { removed }))
}

/// GET /api/projects/{id}/notifications - Notification history, newest first.
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Vec<NotificationEntry>>> {
    let root = state
        .registry
        .resolve(&project_id)
        .await
        .ok_or_else(|| ApiError::ProjectNotFound(project_id.clone()))?;
    Ok(Json(notification_history(&ProjectPaths::new(root)).await))
}

/// GET /api/projects/{id}/iterations - Iteration history, oldest first.
pub async fn project_iterations(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Vec<IterationSummary>>> {
    let root = state
        .registry
        .resolve(&project_id)
        .await
        .ok_or_else(|| ApiError::ProjectNotFound(project_id.clone()))?;
    let iterations = list_iterations(&ProjectPaths::new(root))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(iterations))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/projects", get(list_projects).post(register_project))
        .route("/projects/{id}", delete(unregister_project))
        .route("/projects/{id}/iterations", get(project_iterations))
        .route("/projects/{id}/notifications", get(list_notifications))
}

//! Loop control endpoints. All of them require a bearer access token.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use ralph_dashboard_core::loop_config::{LoopConfig, LoopOverrides};

use crate::auth::Authenticated;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::supervisor::StartResult;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct StopResponse {
    pub stopped: bool,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct PauseResponse {
    pub paused: bool,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct ResumeResponse {
    pub resumed: bool,
}

#[derive(Debug, Deserialize)]
pub struct InjectRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct InjectResponse {
    pub content: String,
}

/// POST /api/projects/{id}/start - Start the loop. The optional body
/// overrides stored config values for this run only.
pub async fn start(
    State(state): State<Arc<AppState>>,
    _auth: Authenticated,
    Path(project_id): Path<String>,
    body: Option<Json<LoopOverrides>>,
) -> ApiResult<Json<StartResult>> {
    let overrides = body.map(|Json(o)| o).unwrap_or_default();
    if let Some(cli) = &overrides.cli {
        if cli.trim().is_empty() {
            return Err(ApiError::BadRequest("cli cannot be empty".to_string()));
        }
    }
    Ok(Json(state.supervisor.start_loop(&project_id, &overrides).await?))
}

/// POST /api/projects/{id}/stop
pub async fn stop(
    State(state): State<Arc<AppState>>,
    _auth: Authenticated,
    Path(project_id): Path<String>,
) -> ApiResult<Json<StopResponse>> {
    let stopped = state.supervisor.stop(&project_id).await?;
    Ok(Json(StopResponse { stopped }))
}

/// POST /api/projects/{id}/pause
pub async fn pause(
    State(state): State<Arc<AppState>>,
    _auth: Authenticated,
    Path(project_id): Path<String>,
) -> ApiResult<Json<PauseResponse>> {
    let paused = state.supervisor.pause(&project_id).await?;
    Ok(Json(PauseResponse { paused }))
}

/// POST /api/projects/{id}/resume
pub async fn resume(
    State(state): State<Arc<AppState>>,
    _auth: Authenticated,
    Path(project_id): Path<String>,
) -> ApiResult<Json<ResumeResponse>> {
    let resumed = state.supervisor.resume(&project_id).await?;
    Ok(Json(ResumeResponse { resumed }))
}

/// POST /api/projects/{id}/inject - Queue an instruction for the next iteration.
pub async fn inject(
    State(state): State<Arc<AppState>>,
    _auth: Authenticated,
    Path(project_id): Path<String>,
    Json(body): Json<InjectRequest>,
) -> ApiResult<Json<InjectResponse>> {
    let content = state.supervisor.inject(&project_id, &body.message).await?;
    Ok(Json(InjectResponse { content }))
}

/// GET /api/projects/{id}/config
pub async fn get_config(
    State(state): State<Arc<AppState>>,
    _auth: Authenticated,
    Path(project_id): Path<String>,
) -> ApiResult<Json<LoopConfig>> {
    Ok(Json(state.supervisor.read_config(&project_id).await?))
}

/// PUT /api/projects/{id}/config
pub async fn put_config(
    State(state): State<Arc<AppState>>,
    _auth: Authenticated,
    Path(project_id): Path<String>,
    Json(config): Json<LoopConfig>,
) -> ApiResult<Json<LoopConfig>> {
    Ok(Json(state.supervisor.write_config(&project_id, config).await?))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/projects/{id}/start", post(start))
        .route("/projects/{id}/stop", post(stop))
        .route("/projects/{id}/pause", post(pause))
        .route("/projects/{id}/resume", post(resume))
        .route("/projects/{id}/inject", post(inject))
        .route("/projects/{id}/config", get(get_config).put(put_config))
}

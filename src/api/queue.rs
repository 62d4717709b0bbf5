//! Queue status and pool-control routes (spec §6).

use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use serde::Serialize;

use crate::AppState;
use crate::db::processing_jobs::JobStatus;
use crate::error::{ApiError, ApiResult};
use crate::services::active_processes::ActiveProcess;

#[derive(Debug, Default, Serialize)]
pub struct QueueStatusResponse {
    active: i64,
    waiting: i64,
    completed: i64,
    failed: i64,
}

/// `GET /processing/queue/status` — per-stage counts collapsed to the
/// four buckets of spec §6 (the state machine of §4.1 has finer-grained
/// in-flight statuses; they all count as `active` here).
async fn status(State(state): State<AppState>) -> ApiResult<axum::Json<QueueStatusResponse>> {
    let counts = state.db.processing_jobs().status_counts().await?;

    let mut response = QueueStatusResponse::default();
    for (status, count) in counts {
        match status {
            JobStatus::Scanning => response.waiting += count,
            JobStatus::Completed => response.completed += count,
            JobStatus::Failed => response.failed += count,
            _ => response.active += count,
        }
    }

    Ok(axum::Json(response))
}

/// `GET /processing/active-ffmpeg` — live map of in-flight subprocesses.
async fn active_ffmpeg(State(state): State<AppState>) -> axum::Json<Vec<ActiveProcess>> {
    axum::Json(state.active_processes.snapshot())
}

/// `POST /settings/queue/{pause,resume}-{cpu,gpu}`
async fn control(State(state): State<AppState>, Path(action): Path<String>) -> ApiResult<axum::Json<serde_json::Value>> {
    let (pool, configured_limit) = match action.as_str() {
        "pause-cpu" | "resume-cpu" => (&state.pools.cpu, state.config.cpu_worker_limit),
        "pause-gpu" | "resume-gpu" => (&state.pools.gpu, state.config.gpu_worker_limit),
        other => return Err(ApiError::BadRequest(format!("unknown queue action: {other}"))),
    };

    if action.starts_with("pause") {
        pool.pause();
    } else {
        pool.resize(configured_limit);
    }

    Ok(axum::Json(serde_json::json!({ "action": action, "limit": pool.limit() })))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/processing/queue/status", get(status))
        .route("/processing/active-ffmpeg", get(active_ffmpeg))
        .route("/settings/queue/{action}", post(control))
}

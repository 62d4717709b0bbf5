//! Show-scoped routes: scan/rescan and detection read models (spec §6).

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use crate::db::detection_results::{ApprovalStatus, DetectionResultRecord};
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    #[serde(rename = "showIds")]
    show_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ScanResponse {
    scanned: usize,
    enqueued: usize,
}

/// `POST /shows/scan` — creates jobs and enqueues Stage 2 for every
/// episode file of the given shows.
async fn scan(State(state): State<AppState>, axum::Json(body): axum::Json<ScanRequest>) -> ApiResult<axum::Json<ScanResponse>> {
    let files = state.db.episode_files().list_with_context_for_shows(&body.show_ids).await?;

    let mut enqueued = 0;
    for file in &files {
        state.orchestrator.submit(file.episode_file_id).await?;
        enqueued += 1;
    }

    Ok(axum::Json(ScanResponse { scanned: body.show_ids.len(), enqueued }))
}

/// `POST /shows/rescan` — invalidates fingerprints and detection results
/// for the shows first, then behaves like `scan`.
async fn rescan(State(state): State<AppState>, axum::Json(body): axum::Json<ScanRequest>) -> ApiResult<axum::Json<ScanResponse>> {
    let files = state.db.episode_files().list_with_context_for_shows(&body.show_ids).await?;
    let episode_file_ids: Vec<Uuid> = files.iter().map(|f| f.episode_file_id).collect();

    state.db.fingerprints().delete_for_episode_files(&episode_file_ids).await?;
    state.db.detection_results().delete_for_shows(&body.show_ids).await?;

    let mut enqueued = 0;
    for file in &files {
        state.orchestrator.submit(file.episode_file_id).await?;
        enqueued += 1;
    }

    Ok(axum::Json(ScanResponse { scanned: body.show_ids.len(), enqueued }))
}

#[derive(Debug, Serialize)]
pub struct DetectionStatsResponse {
    pending: i64,
    auto_approved: i64,
    manual_approved: i64,
    rejected: i64,
}

/// `GET /shows/{id}/detection-stats`
async fn detection_stats(
    State(state): State<AppState>,
    Path(show_id): Path<Uuid>,
) -> ApiResult<axum::Json<DetectionStatsResponse>> {
    state.db.shows().get(show_id).await?.ok_or_else(|| ApiError::NotFound("show".into()))?;

    let counts = state.db.detection_results().stats_by_status(show_id).await?;
    let mut stats = DetectionStatsResponse { pending: 0, auto_approved: 0, manual_approved: 0, rejected: 0 };
    for (status, count) in counts {
        match status {
            ApprovalStatus::Pending => stats.pending = count,
            ApprovalStatus::AutoApproved => stats.auto_approved = count,
            ApprovalStatus::ManualApproved => stats.manual_approved = count,
            ApprovalStatus::Rejected => stats.rejected = count,
        }
    }

    Ok(axum::Json(stats))
}

#[derive(Debug, Deserialize)]
pub struct SegmentsQuery {
    season: Option<i32>,
}

/// `GET /shows/{id}/segments?season=N` — intro/credits/stingers per episode.
async fn segments(
    State(state): State<AppState>,
    Path(show_id): Path<Uuid>,
    Query(query): Query<SegmentsQuery>,
) -> ApiResult<axum::Json<Vec<DetectionResultRecord>>> {
    state.db.shows().get(show_id).await?.ok_or_else(|| ApiError::NotFound("show".into()))?;

    let records = state.db.detection_results().list_for_show_season(show_id, query.season).await?;
    Ok(axum::Json(records))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/shows/scan", post(scan))
        .route("/shows/rescan", post(rescan))
        .route("/shows/{id}/detection-stats", get(detection_stats))
        .route("/shows/{id}/segments", get(segments))
}

//! Processing-job routes: list, patch, delete, bulk-delete (spec §6).

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use crate::db::processing_jobs::{JobListFilter, ProcessingJobRecord, UpdateProcessingJob};
use crate::error::{ApiError, ApiResult};

/// `GET /processing/jobs?status=X&limit=N`
async fn list(
    State(state): State<AppState>,
    Query(filter): Query<JobListFilter>,
) -> ApiResult<axum::Json<Vec<ProcessingJobRecord>>> {
    let jobs = state.db.processing_jobs().list(filter).await?;
    Ok(axum::Json(jobs))
}

/// `PUT /processing/jobs/{id}` — patches the allowed fields of spec §6.
/// Routed through the orchestrator (not the repository directly) so a
/// manual approval that sets `status: verified` enqueues Stage 5 the same
/// way auto-approval does.
async fn patch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    axum::Json(patch): axum::Json<UpdateProcessingJob>,
) -> ApiResult<axum::Json<ProcessingJobRecord>> {
    let record = state.orchestrator.apply_patch(id, patch).await?;
    Ok(axum::Json(record))
}

/// `DELETE /processing/jobs/{id}` — full cleanup per spec §4.7.
async fn remove(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<axum::Json<serde_json::Value>> {
    let job = state.db.processing_jobs().get(id).await?.ok_or_else(|| ApiError::NotFound("job".into()))?;
    state.cleanup.cleanup_job(job.id, job.episode_file_id).await?;
    Ok(axum::Json(serde_json::json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BulkDeleteRequest {
    Ids {
        #[serde(rename = "jobIds")]
        job_ids: Vec<Uuid>,
    },
    All {
        all: bool,
    },
}

#[derive(Debug, Serialize)]
struct BulkDeleteResponse {
    deleted: u64,
}

/// `POST /processing/jobs/bulk-delete` — pauses pools, deletes, resumes.
async fn bulk_delete(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<BulkDeleteRequest>,
) -> ApiResult<axum::Json<BulkDeleteResponse>> {
    let deleted = match body {
        BulkDeleteRequest::Ids { job_ids } => state.cleanup.bulk_delete(&job_ids).await?,
        BulkDeleteRequest::All { all: true } => state.cleanup.delete_all().await?,
        BulkDeleteRequest::All { all: false } => 0,
    };

    Ok(axum::Json(BulkDeleteResponse { deleted }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/processing/jobs", get(list))
        .route("/processing/jobs/{id}", put(patch).delete(remove))
        .route("/processing/jobs/bulk-delete", post(bulk_delete))
}

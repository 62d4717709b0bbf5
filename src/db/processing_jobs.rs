//! Processing job database repository
//!
//! `ProcessingJob` is the authoritative per-file pipeline state the
//! orchestrator drives through (spec §4.1).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

/// The finite set of pipeline states, closed over a serde boundary rather
/// than reflected-over status strings (see spec §9, "Dynamic dispatch").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scanning,
    ExtractingAudio,
    Fingerprinting,
    AwaitingCohort,
    Detecting,
    Detected,
    Verified,
    Trimming,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// A processing job record from the database.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProcessingJobRecord {
    pub id: Uuid,
    pub episode_file_id: Uuid,
    pub status: JobStatus,
    pub failure_kind: Option<String>,
    pub confidence_score: Option<f64>,
    pub intro_start: Option<f64>,
    pub intro_end: Option<f64>,
    pub credits_start: Option<f64>,
    pub credits_end: Option<f64>,
    pub manual_verified: bool,
    pub processing_notes: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Patchable fields for `PUT /processing/jobs/{id}` (spec §6).
#[derive(Debug, Default, Deserialize)]
pub struct UpdateProcessingJob {
    pub status: Option<JobStatus>,
    pub confidence_score: Option<f64>,
    pub intro_start: Option<f64>,
    pub intro_end: Option<f64>,
    pub credits_start: Option<f64>,
    pub credits_end: Option<f64>,
    pub manual_verified: Option<bool>,
    pub processing_notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JobListFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<i64>,
}

pub struct ProcessingJobRepository {
    pool: PgPool,
}

impl ProcessingJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// `submit`: idempotent create — returns the existing active job for
    /// this file if one exists, otherwise inserts a fresh `scanning` job.
    pub async fn submit(&self, episode_file_id: Uuid) -> Result<ProcessingJobRecord> {
        if let Some(existing) = self.get_by_episode_file(episode_file_id).await? {
            if !existing.status.is_terminal() {
                return Ok(existing);
            }
        }

        let record = sqlx::query_as::<_, ProcessingJobRecord>(
            r#"
            INSERT INTO processing_jobs (episode_file_id, status)
            VALUES ($1, 'scanning')
            ON CONFLICT (episode_file_id) DO UPDATE SET
                status = 'scanning',
                failure_kind = NULL,
                confidence_score = NULL,
                intro_start = NULL,
                intro_end = NULL,
                credits_start = NULL,
                credits_end = NULL,
                manual_verified = false,
                processing_notes = NULL,
                updated_at = now()
            RETURNING id, episode_file_id, status, failure_kind, confidence_score,
                      intro_start, intro_end, credits_start, credits_end,
                      manual_verified, processing_notes, created_at, updated_at
            "#,
        )
        .bind(episode_file_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ProcessingJobRecord>> {
        let record = sqlx::query_as::<_, ProcessingJobRecord>(
            "SELECT id, episode_file_id, status, failure_kind, confidence_score, \
             intro_start, intro_end, credits_start, credits_end, manual_verified, \
             processing_notes, created_at, updated_at \
             FROM processing_jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn get_by_episode_file(
        &self,
        episode_file_id: Uuid,
    ) -> Result<Option<ProcessingJobRecord>> {
        let record = sqlx::query_as::<_, ProcessingJobRecord>(
            "SELECT id, episode_file_id, status, failure_kind, confidence_score, \
             intro_start, intro_end, credits_start, credits_end, manual_verified, \
             processing_notes, created_at, updated_at \
             FROM processing_jobs WHERE episode_file_id = $1",
        )
        .bind(episode_file_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn list(&self, filter: JobListFilter) -> Result<Vec<ProcessingJobRecord>> {
        let records = sqlx::query_as::<_, ProcessingJobRecord>(
            "SELECT id, episode_file_id, status, failure_kind, confidence_score, \
             intro_start, intro_end, credits_start, credits_end, manual_verified, \
             processing_notes, created_at, updated_at \
             FROM processing_jobs \
             WHERE $1::text IS NULL OR status = $1 \
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(filter.status)
        .bind(filter.limit.unwrap_or(100))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Set status unconditionally; callers are responsible for honoring
    /// the transition table in spec §4.1.
    pub async fn set_status(&self, id: Uuid, status: JobStatus) -> Result<()> {
        sqlx::query("UPDATE processing_jobs SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn mark_failed(
        &self,
        id: Uuid,
        failure_kind: &str,
        note: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE processing_jobs SET status = 'failed', failure_kind = $2, \
             processing_notes = COALESCE($3, processing_notes), updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(failure_kind)
        .bind(note)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_confidence(&self, id: Uuid, confidence_score: f64) -> Result<()> {
        sqlx::query(
            "UPDATE processing_jobs SET confidence_score = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(confidence_score)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn apply_patch(&self, id: Uuid, patch: UpdateProcessingJob) -> Result<ProcessingJobRecord> {
        let record = sqlx::query_as::<_, ProcessingJobRecord>(
            r#"
            UPDATE processing_jobs SET
                status = COALESCE($2, status),
                confidence_score = COALESCE($3, confidence_score),
                intro_start = COALESCE($4, intro_start),
                intro_end = COALESCE($5, intro_end),
                credits_start = COALESCE($6, credits_start),
                credits_end = COALESCE($7, credits_end),
                manual_verified = COALESCE($8, manual_verified),
                processing_notes = COALESCE($9, processing_notes),
                updated_at = now()
            WHERE id = $1
            RETURNING id, episode_file_id, status, failure_kind, confidence_score,
                      intro_start, intro_end, credits_start, credits_end,
                      manual_verified, processing_notes, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(patch.status)
        .bind(patch.confidence_score)
        .bind(patch.intro_start)
        .bind(patch.intro_end)
        .bind(patch.credits_start)
        .bind(patch.credits_end)
        .bind(patch.manual_verified)
        .bind(patch.processing_notes)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// `requeue`: reset to `scanning`; caller deletes dependent fingerprints
    /// and detection results in the same transaction (see `requeue` on the
    /// orchestrator).
    pub async fn reset_to_scanning(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE processing_jobs SET status = 'scanning', failure_kind = NULL, \
             confidence_score = NULL, intro_start = NULL, intro_end = NULL, \
             credits_start = NULL, credits_end = NULL, processing_notes = NULL, \
             updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM processing_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_many(&self, ids: &[Uuid]) -> Result<u64> {
        let result = sqlx::query("DELETE FROM processing_jobs WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn delete_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM processing_jobs")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn list_all_ids(&self) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM processing_jobs")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Counts for `/processing/queue/status`, bucketed by status.
    pub async fn status_counts(&self) -> Result<Vec<(JobStatus, i64)>> {
        let rows: Vec<(JobStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM processing_jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

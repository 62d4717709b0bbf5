//! Detection result database repository

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    AutoApproved,
    ManualApproved,
    Rejected,
}

/// A single stinger interval, stored as a JSONB array element.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Interval {
    pub start: f64,
    pub end: f64,
}

/// A cohort-level or per-episode segment, labeled per spec §4.4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub label: SegmentLabel,
    pub start: f64,
    pub end: f64,
    pub episode_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentLabel {
    Intro,
    Credits,
    Stinger,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DetectionResultRecord {
    pub id: Uuid,
    pub show_id: Uuid,
    pub season_number: i32,
    pub episode_number: i32,
    pub intro_start: Option<f64>,
    pub intro_end: Option<f64>,
    pub credits_start: Option<f64>,
    pub credits_end: Option<f64>,
    pub stingers: serde_json::Value,
    pub segments: serde_json::Value,
    pub confidence_score: f64,
    pub detection_method: String,
    pub approval_status: ApprovalStatus,
    pub processing_notes: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Per-episode payload the detector writes (spec §4.4, "Per-episode output").
#[derive(Debug, Clone)]
pub struct UpsertDetectionResult {
    pub show_id: Uuid,
    pub season_number: i32,
    pub episode_number: i32,
    pub intro_start: Option<f64>,
    pub intro_end: Option<f64>,
    pub credits_start: Option<f64>,
    pub credits_end: Option<f64>,
    pub stingers: Vec<Interval>,
    pub segments: Vec<Segment>,
    pub confidence_score: f64,
    pub detection_method: String,
    pub approval_status: ApprovalStatus,
    pub processing_notes: Option<String>,
}

pub struct DetectionResultRepository {
    pool: PgPool,
}

impl DetectionResultRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert one episode's detection result. Callers that write a whole
    /// cohort in one go should wrap their loop in `self.pool().begin()`
    /// themselves — the detector does this to satisfy the "one transaction
    /// per cohort" requirement of spec §5.
    pub async fn upsert(
        &self,
        tx: &mut sqlx::PgConnection,
        input: UpsertDetectionResult,
    ) -> Result<DetectionResultRecord> {
        let stingers = serde_json::to_value(&input.stingers)?;
        let segments = serde_json::to_value(&input.segments)?;

        let record = sqlx::query_as::<_, DetectionResultRecord>(
            r#"
            INSERT INTO detection_results (
                show_id, season_number, episode_number,
                intro_start, intro_end, credits_start, credits_end,
                stingers, segments, confidence_score, detection_method,
                approval_status, processing_notes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (show_id, season_number, episode_number) DO UPDATE SET
                intro_start = EXCLUDED.intro_start,
                intro_end = EXCLUDED.intro_end,
                credits_start = EXCLUDED.credits_start,
                credits_end = EXCLUDED.credits_end,
                stingers = EXCLUDED.stingers,
                segments = EXCLUDED.segments,
                confidence_score = EXCLUDED.confidence_score,
                detection_method = EXCLUDED.detection_method,
                approval_status = EXCLUDED.approval_status,
                processing_notes = EXCLUDED.processing_notes,
                updated_at = now()
            RETURNING id, show_id, season_number, episode_number, intro_start, intro_end,
                      credits_start, credits_end, stingers, segments, confidence_score,
                      detection_method, approval_status, processing_notes, created_at, updated_at
            "#,
        )
        .bind(input.show_id)
        .bind(input.season_number)
        .bind(input.episode_number)
        .bind(input.intro_start)
        .bind(input.intro_end)
        .bind(input.credits_start)
        .bind(input.credits_end)
        .bind(stingers)
        .bind(segments)
        .bind(input.confidence_score)
        .bind(input.detection_method)
        .bind(input.approval_status)
        .bind(input.processing_notes)
        .fetch_one(&mut *tx)
        .await?;

        Ok(record)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn get(
        &self,
        show_id: Uuid,
        season_number: i32,
        episode_number: i32,
    ) -> Result<Option<DetectionResultRecord>> {
        let record = sqlx::query_as::<_, DetectionResultRecord>(
            "SELECT id, show_id, season_number, episode_number, intro_start, intro_end, \
             credits_start, credits_end, stingers, segments, confidence_score, \
             detection_method, approval_status, processing_notes, created_at, updated_at \
             FROM detection_results WHERE show_id = $1 AND season_number = $2 AND episode_number = $3",
        )
        .bind(show_id)
        .bind(season_number)
        .bind(episode_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn list_for_show_season(
        &self,
        show_id: Uuid,
        season_number: Option<i32>,
    ) -> Result<Vec<DetectionResultRecord>> {
        let records = sqlx::query_as::<_, DetectionResultRecord>(
            "SELECT id, show_id, season_number, episode_number, intro_start, intro_end, \
             credits_start, credits_end, stingers, segments, confidence_score, \
             detection_method, approval_status, processing_notes, created_at, updated_at \
             FROM detection_results \
             WHERE show_id = $1 AND ($2::int IS NULL OR season_number = $2) \
             ORDER BY season_number, episode_number",
        )
        .bind(show_id)
        .bind(season_number)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Aggregated counts for `/shows/{id}/detection-stats`.
    pub async fn stats_by_status(&self, show_id: Uuid) -> Result<Vec<(ApprovalStatus, i64)>> {
        let rows: Vec<(ApprovalStatus, i64)> = sqlx::query_as(
            "SELECT approval_status, COUNT(*) FROM detection_results \
             WHERE show_id = $1 GROUP BY approval_status",
        )
        .bind(show_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Single-row delete for `CleanupService::cleanup_job` (spec §4.7) —
    /// `detection_results` has no foreign key to `processing_jobs`, so a
    /// job delete must look this row up by its natural key itself.
    pub async fn delete_one(&self, show_id: Uuid, season_number: i32, episode_number: i32) -> Result<()> {
        sqlx::query("DELETE FROM detection_results WHERE show_id = $1 AND season_number = $2 AND episode_number = $3")
            .bind(show_id)
            .bind(season_number)
            .bind(episode_number)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn delete_for_shows(&self, show_ids: &[Uuid]) -> Result<()> {
        sqlx::query("DELETE FROM detection_results WHERE show_id = ANY($1)")
            .bind(show_ids)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

//! Episode and episode-file database repositories

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

/// An episode record from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EpisodeRecord {
    pub id: Uuid,
    pub season_id: Uuid,
    pub episode_number: i32,
    pub title: Option<String>,
    pub external_id: Option<String>,
}

/// Input for creating an episode.
#[derive(Debug)]
pub struct CreateEpisode {
    pub season_id: Uuid,
    pub episode_number: i32,
    pub title: Option<String>,
    pub external_id: Option<String>,
}

/// An episode file record from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EpisodeFileRecord {
    pub id: Uuid,
    pub episode_id: Uuid,
    pub path: String,
    pub size: i64,
}

/// An episode file joined with its episode/season/show identifiers —
/// the shape most pipeline stages actually need.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EpisodeFileWithContext {
    pub episode_file_id: Uuid,
    pub path: String,
    pub episode_id: Uuid,
    pub episode_number: i32,
    pub season_id: Uuid,
    pub season_number: i32,
    pub show_id: Uuid,
}

pub struct EpisodeRepository {
    pool: PgPool,
}

impl EpisodeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_or_get(&self, input: CreateEpisode) -> Result<EpisodeRecord> {
        let record = sqlx::query_as::<_, EpisodeRecord>(
            r#"
            INSERT INTO episodes (season_id, episode_number, title, external_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (season_id, episode_number) DO UPDATE SET title = EXCLUDED.title
            RETURNING id, season_id, episode_number, title, external_id
            "#,
        )
        .bind(input.season_id)
        .bind(input.episode_number)
        .bind(input.title)
        .bind(input.external_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn list_by_season(&self, season_id: Uuid) -> Result<Vec<EpisodeRecord>> {
        let records = sqlx::query_as::<_, EpisodeRecord>(
            "SELECT id, season_id, episode_number, title, external_id FROM episodes \
             WHERE season_id = $1 ORDER BY episode_number",
        )
        .bind(season_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

pub struct EpisodeFileRepository {
    pool: PgPool,
}

impl EpisodeFileRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, episode_id: Uuid, path: &str, size: i64) -> Result<EpisodeFileRecord> {
        let record = sqlx::query_as::<_, EpisodeFileRecord>(
            r#"
            INSERT INTO episode_files (episode_id, path, size)
            VALUES ($1, $2, $3)
            RETURNING id, episode_id, path, size
            "#,
        )
        .bind(episode_id)
        .bind(path)
        .bind(size)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// Resolve an `episode_file_id` into the concrete on-disk path plus
    /// cohort identifiers, used by the episode processor (Stage 1).
    pub async fn get_with_context(
        &self,
        episode_file_id: Uuid,
    ) -> Result<Option<EpisodeFileWithContext>> {
        let record = sqlx::query_as::<_, EpisodeFileWithContext>(
            r#"
            SELECT
                ef.id AS episode_file_id,
                ef.path,
                e.id AS episode_id,
                e.episode_number,
                s.id AS season_id,
                s.season_number,
                s.show_id
            FROM episode_files ef
            JOIN episodes e ON e.id = ef.episode_id
            JOIN seasons s ON s.id = e.season_id
            WHERE ef.id = $1
            "#,
        )
        .bind(episode_file_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// All episode file ids (with context) for a set of shows, used by
    /// `/shows/scan` and `/shows/rescan`.
    pub async fn list_with_context_for_shows(
        &self,
        show_ids: &[Uuid],
    ) -> Result<Vec<EpisodeFileWithContext>> {
        let records = sqlx::query_as::<_, EpisodeFileWithContext>(
            r#"
            SELECT
                ef.id AS episode_file_id,
                ef.path,
                e.id AS episode_id,
                e.episode_number,
                s.id AS season_id,
                s.season_number,
                s.show_id
            FROM episode_files ef
            JOIN episodes e ON e.id = ef.episode_id
            JOIN seasons s ON s.id = e.season_id
            WHERE s.show_id = ANY($1)
            ORDER BY s.season_number, e.episode_number
            "#,
        )
        .bind(show_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Episode files with no `processing_jobs` row yet — the set the
    /// PVR-import poller hands to `Orchestrator::submit` (spec §1).
    pub async fn list_unprocessed(&self) -> Result<Vec<EpisodeFileWithContext>> {
        let records = sqlx::query_as::<_, EpisodeFileWithContext>(
            r#"
            SELECT
                ef.id AS episode_file_id,
                ef.path,
                e.id AS episode_id,
                e.episode_number,
                s.id AS season_id,
                s.season_number,
                s.show_id
            FROM episode_files ef
            JOIN episodes e ON e.id = ef.episode_id
            JOIN seasons s ON s.id = e.season_id
            LEFT JOIN processing_jobs pj ON pj.episode_file_id = ef.id
            WHERE pj.id IS NULL
            ORDER BY s.season_number, e.episode_number
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// All episode files belonging to the same cohort (show, season) as
    /// `episode_file_id`, used by the cohort-ready predicate.
    pub async fn list_with_context_for_cohort(
        &self,
        show_id: Uuid,
        season_number: i32,
    ) -> Result<Vec<EpisodeFileWithContext>> {
        let records = sqlx::query_as::<_, EpisodeFileWithContext>(
            r#"
            SELECT
                ef.id AS episode_file_id,
                ef.path,
                e.id AS episode_id,
                e.episode_number,
                s.id AS season_id,
                s.season_number,
                s.show_id
            FROM episode_files ef
            JOIN episodes e ON e.id = ef.episode_id
            JOIN seasons s ON s.id = e.season_id
            WHERE s.show_id = $1 AND s.season_number = $2
            ORDER BY e.episode_number
            "#,
        )
        .bind(show_id)
        .bind(season_number)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

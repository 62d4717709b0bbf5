//! Show and season database repositories

use anyhow::Result;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

/// A show record from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ShowRecord {
    pub id: Uuid,
    pub title: String,
    pub external_id: String,
    pub path: String,
    pub created_at: OffsetDateTime,
}

/// Input for creating a show.
#[derive(Debug)]
pub struct CreateShow {
    pub title: String,
    pub external_id: String,
    pub path: String,
}

/// A season record from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SeasonRecord {
    pub id: Uuid,
    pub show_id: Uuid,
    pub season_number: i32,
}

pub struct ShowRepository {
    pool: PgPool,
}

impl ShowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a show, or return the existing one for the same `external_id`.
    pub async fn create_or_get(&self, input: CreateShow) -> Result<ShowRecord> {
        let record = sqlx::query_as::<_, ShowRecord>(
            r#"
            INSERT INTO shows (title, external_id, path)
            VALUES ($1, $2, $3)
            ON CONFLICT (external_id) DO UPDATE SET path = EXCLUDED.path
            RETURNING id, title, external_id, path, created_at
            "#,
        )
        .bind(input.title)
        .bind(input.external_id)
        .bind(input.path)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ShowRecord>> {
        let record = sqlx::query_as::<_, ShowRecord>(
            "SELECT id, title, external_id, path, created_at FROM shows WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn list(&self, ids: &[Uuid]) -> Result<Vec<ShowRecord>> {
        if ids.is_empty() {
            let records = sqlx::query_as::<_, ShowRecord>(
                "SELECT id, title, external_id, path, created_at FROM shows ORDER BY title",
            )
            .fetch_all(&self.pool)
            .await?;
            return Ok(records);
        }

        let records = sqlx::query_as::<_, ShowRecord>(
            "SELECT id, title, external_id, path, created_at FROM shows WHERE id = ANY($1) ORDER BY title",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Get or create the season row for `(show_id, season_number)`.
    pub async fn get_or_create_season(
        &self,
        show_id: Uuid,
        season_number: i32,
    ) -> Result<SeasonRecord> {
        let record = sqlx::query_as::<_, SeasonRecord>(
            r#"
            INSERT INTO seasons (show_id, season_number)
            VALUES ($1, $2)
            ON CONFLICT (show_id, season_number) DO UPDATE SET season_number = EXCLUDED.season_number
            RETURNING id, show_id, season_number
            "#,
        )
        .bind(show_id)
        .bind(season_number)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }
}

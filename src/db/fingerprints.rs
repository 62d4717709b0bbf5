//! Fingerprint database repository

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

/// One `(window_start_seconds, hash)` row, per spec §3.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FingerprintRecord {
    pub episode_file_id: Uuid,
    pub window_start_seconds: f64,
    pub hash: Vec<u8>,
}

pub struct FingerprintRepository {
    pool: PgPool,
}

impl FingerprintRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a full window set for one episode file in a single
    /// transaction (spec §4.3 windowing: "Persist results in a single
    /// transaction").
    pub async fn replace_all(
        &self,
        episode_file_id: Uuid,
        windows: &[(f64, Vec<u8>)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM fingerprints WHERE episode_file_id = $1")
            .bind(episode_file_id)
            .execute(&mut *tx)
            .await?;

        for (window_start_seconds, hash) in windows {
            sqlx::query(
                "INSERT INTO fingerprints (episode_file_id, window_start_seconds, hash) \
                 VALUES ($1, $2, $3)",
            )
            .bind(episode_file_id)
            .bind(window_start_seconds)
            .bind(hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_by_episode_file(
        &self,
        episode_file_id: Uuid,
    ) -> Result<Vec<FingerprintRecord>> {
        let records = sqlx::query_as::<_, FingerprintRecord>(
            "SELECT episode_file_id, window_start_seconds, hash FROM fingerprints \
             WHERE episode_file_id = $1 ORDER BY window_start_seconds",
        )
        .bind(episode_file_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    pub async fn list_by_episode_files(
        &self,
        episode_file_ids: &[Uuid],
    ) -> Result<Vec<FingerprintRecord>> {
        let records = sqlx::query_as::<_, FingerprintRecord>(
            "SELECT episode_file_id, window_start_seconds, hash FROM fingerprints \
             WHERE episode_file_id = ANY($1) ORDER BY episode_file_id, window_start_seconds",
        )
        .bind(episode_file_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    pub async fn delete_for_episode_file(&self, episode_file_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM fingerprints WHERE episode_file_id = $1")
            .bind(episode_file_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Bulk invalidation for `/shows/rescan` (spec §6).
    pub async fn delete_for_episode_files(&self, episode_file_ids: &[Uuid]) -> Result<()> {
        sqlx::query("DELETE FROM fingerprints WHERE episode_file_id = ANY($1)")
            .bind(episode_file_ids)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

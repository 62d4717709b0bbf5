//! Application settings database operations
//!
//! Backs the process-wide settings surface of spec §6 (CPU/GPU worker
//! counts, output/temp directories, thresholds, auto-process flags).

use anyhow::Result;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use time::OffsetDateTime;

/// A setting record in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SettingRecord {
    pub key: String,
    pub value: JsonValue,
    pub updated_at: OffsetDateTime,
}

/// Settings repository for database operations.
pub struct SettingsRepository {
    pool: PgPool,
}

impl SettingsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<SettingRecord>> {
        let record = sqlx::query_as::<_, SettingRecord>(
            "SELECT key, value, updated_at FROM settings WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn get_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let record = self.get(key).await?;
        match record {
            Some(r) => Ok(Some(serde_json::from_value(r.value)?)),
            None => Ok(None),
        }
    }

    pub async fn get_or_default<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T> {
        match self.get_value(key).await? {
            Some(v) => Ok(v),
            None => Ok(default),
        }
    }

    pub async fn list_all(&self) -> Result<Vec<SettingRecord>> {
        let records = sqlx::query_as::<_, SettingRecord>(
            "SELECT key, value, updated_at FROM settings ORDER BY key",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    pub async fn set<T: serde::Serialize>(&self, key: &str, value: T) -> Result<SettingRecord> {
        let json_value = serde_json::to_value(value)?;

        let record = sqlx::query_as::<_, SettingRecord>(
            r#"
            INSERT INTO settings (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = $2, updated_at = now()
            RETURNING key, value, updated_at
            "#,
        )
        .bind(key)
        .bind(json_value)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM settings WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

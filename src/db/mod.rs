//! Database connection and repositories

pub mod detection_results;
pub mod episodes;
pub mod fingerprints;
pub mod processing_jobs;
pub mod settings;
pub mod shows;

use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

pub use detection_results::DetectionResultRepository;
pub use episodes::{EpisodeFileRepository, EpisodeRepository};
pub use fingerprints::FingerprintRepository;
pub use processing_jobs::{JobStatus, ProcessingJobRepository};
pub use settings::SettingsRepository;
pub use shows::ShowRepository;

/// Database wrapper providing connection pool access and per-entity
/// repositories, mirroring the teacher's `Database` facade.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        Ok(Self { pool })
    }

    /// Connect with retry, so the binary can come up before the database
    /// container finishes its own startup.
    pub async fn connect_with_retry(url: &str, timeout: Duration) -> Self {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match Self::connect(url).await {
                Ok(db) => return db,
                Err(e) if tokio::time::Instant::now() < deadline => {
                    warn!(error = %e, "database not ready yet, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => panic!("failed to connect to database: {e}"),
            }
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    pub fn shows(&self) -> ShowRepository {
        ShowRepository::new(self.pool.clone())
    }

    pub fn episodes(&self) -> EpisodeRepository {
        EpisodeRepository::new(self.pool.clone())
    }

    pub fn episode_files(&self) -> EpisodeFileRepository {
        EpisodeFileRepository::new(self.pool.clone())
    }

    pub fn processing_jobs(&self) -> ProcessingJobRepository {
        ProcessingJobRepository::new(self.pool.clone())
    }

    pub fn fingerprints(&self) -> FingerprintRepository {
        FingerprintRepository::new(self.pool.clone())
    }

    pub fn detection_results(&self) -> DetectionResultRepository {
        DetectionResultRepository::new(self.pool.clone())
    }

    pub fn settings(&self) -> SettingsRepository {
        SettingsRepository::new(self.pool.clone())
    }
}

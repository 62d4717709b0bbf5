//! PVR import boundary (spec §1).
//!
//! The real Sonarr/Radarr-style import client lives outside this repo;
//! `PvrImport` is the seam the pipeline calls through so a real client
//! can be dropped in without touching the orchestrator. `StubPvrImport`
//! is the only implementation shipped here — it discovers work by
//! reading episode files already sitting in the store with no
//! `processing_jobs` row, as if some external importer had just written
//! them.

use async_trait::async_trait;
use uuid::Uuid;

use crate::db::Database;

#[async_trait]
pub trait PvrImport: Send + Sync {
    /// Episode file ids ready for Stage 1, in discovery order.
    async fn discover(&self) -> anyhow::Result<Vec<Uuid>>;
}

pub struct StubPvrImport {
    db: Database,
}

impl StubPvrImport {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PvrImport for StubPvrImport {
    async fn discover(&self) -> anyhow::Result<Vec<Uuid>> {
        let files = self.db.episode_files().list_unprocessed().await?;
        Ok(files.into_iter().map(|f| f.episode_file_id).collect())
    }
}

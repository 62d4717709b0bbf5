//! Scratch-file and dependent-row cleanup on job deletion (spec §4.7)

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::services::active_processes::ActiveProcessTable;
use crate::services::pools::WorkerPools;
use crate::services::progress::ProgressBroadcaster;

#[derive(Clone)]
pub struct CleanupService {
    db: Database,
    pools: WorkerPools,
    active: ActiveProcessTable,
    broadcaster: ProgressBroadcaster,
    temp_dir: PathBuf,
}

impl CleanupService {
    pub fn new(
        db: Database,
        pools: WorkerPools,
        active: ActiveProcessTable,
        broadcaster: ProgressBroadcaster,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self { db, pools, active, broadcaster, temp_dir: temp_dir.into() }
    }

    /// Full cleanup of one job: kill its subprocess, unlink scratch files
    /// named with its id, delete dependent fingerprint and detection-result
    /// rows, delete the job row, emit `job_deleted`.
    pub async fn cleanup_job(&self, job_id: Uuid, episode_file_id: Uuid) -> Result<()> {
        self.active.terminate(job_id);
        self.unlink_scratch_files(job_id, episode_file_id).await;

        self.db.fingerprints().delete_for_episode_file(episode_file_id).await?;
        self.delete_detection_result(episode_file_id).await?;
        self.db.processing_jobs().delete(job_id).await?;

        self.broadcaster.publish_job_deleted(job_id);
        info!(job_id = %job_id, episode_file_id = %episode_file_id, "job cleaned up");
        Ok(())
    }

    /// `detection_results` is keyed by `(show_id, season_number,
    /// episode_number)`, not by job or episode file, so deleting it
    /// requires resolving the episode file's cohort identifiers first.
    async fn delete_detection_result(&self, episode_file_id: Uuid) -> Result<()> {
        if let Some(context) = self.db.episode_files().get_with_context(episode_file_id).await? {
            self.db
                .detection_results()
                .delete_one(context.show_id, context.season_number, context.episode_number)
                .await?;
        }
        Ok(())
    }

    /// Bulk delete: pause both pools first so in-flight workers can't pick
    /// up a job mid-deletion, delete everything, then resume (spec §4.7
    /// "pauses all worker pools before starting").
    pub async fn bulk_delete(&self, job_ids: &[Uuid]) -> Result<u64> {
        let previous_limits = self.pools.pause_all();

        let mut deleted_episode_files = Vec::with_capacity(job_ids.len());
        for &job_id in job_ids {
            if let Some(job) = self.db.processing_jobs().get(job_id).await? {
                self.active.terminate(job_id);
                self.unlink_scratch_files(job_id, job.episode_file_id).await;
                deleted_episode_files.push(job.episode_file_id);
            }
        }

        for episode_file_id in &deleted_episode_files {
            self.db.fingerprints().delete_for_episode_file(*episode_file_id).await?;
            self.delete_detection_result(*episode_file_id).await?;
        }

        let deleted = self.db.processing_jobs().delete_many(job_ids).await?;

        for &job_id in job_ids {
            self.broadcaster.publish_job_deleted(job_id);
        }

        self.pools.resume(previous_limits);
        info!(count = deleted, "bulk delete completed, pools resumed");
        Ok(deleted)
    }

    /// Delete every job in the store (the `{all:true}` bulk-delete variant).
    pub async fn delete_all(&self) -> Result<u64> {
        let ids = self.db.processing_jobs().list_all_ids().await?;
        self.bulk_delete(&ids).await
    }

    async fn unlink_scratch_files(&self, job_id: Uuid, episode_file_id: Uuid) {
        let audio_path = self.temp_dir.join("audio").join(format!("{job_id}-{episode_file_id}.wav"));
        remove_if_exists(&audio_path).await;

        let chunk_dir = self.temp_dir.join("chunks").join(job_id.to_string());
        if chunk_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&chunk_dir).await {
                warn!(path = %chunk_dir.display(), error = %e, "failed to remove chunk directory");
            }
        }
    }
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove scratch file"),
    }
}

//! Stage 1: Episode Processor
//!
//! Resolves an `episode_file_id` into a concrete on-disk path, validates
//! existence, and hands the job to Stage 2 (spec §2 item 1). This is
//! deliberately thin — the filesystem walk that discovers new episode
//! files is owned by the external import collaborator (spec §1); this
//! stage only re-validates what the store already has on file.

use std::path::Path;

use tracing::{info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::pipeline::error::{JobFailureKind, StageError};

pub struct EpisodeProcessor;

impl EpisodeProcessor {
    /// Validate the on-disk file still exists, returning its absolute
    /// path. Fails with `file_missing` (non-retryable: spec §7 "input
    /// validation... never retried") if the file vanished between scan
    /// and processing.
    pub async fn resolve(db: &Database, episode_file_id: Uuid) -> Result<String, StageError> {
        let context = db
            .episode_files()
            .get_with_context(episode_file_id)
            .await
            .map_err(|e| StageError::new(JobFailureKind::DatabaseError, e.to_string()))?
            .ok_or_else(|| StageError::new(JobFailureKind::FileMissing, "episode file record not found"))?;

        if !Path::new(&context.path).exists() {
            warn!(episode_file_id = %episode_file_id, path = %context.path, "source file missing");
            return Err(StageError::new(JobFailureKind::FileMissing, format!("file does not exist: {}", context.path)));
        }

        info!(episode_file_id = %episode_file_id, path = %context.path, "episode file resolved");
        Ok(context.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_error_is_not_retryable() {
        let err = StageError::new(JobFailureKind::FileMissing, "gone");
        assert!(!err.kind.is_retryable());
    }
}

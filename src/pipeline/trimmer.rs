//! Stage 5: Trimmer
//!
//! Consumes an approved `DetectionResult`, builds the surviving time
//! ranges, and invokes FFmpeg to produce the cleaned output (spec §4.5).

use std::path::{Path, PathBuf};

use tracing::info;
use uuid::Uuid;

use crate::db::detection_results::DetectionResultRecord;
use crate::pipeline::error::{JobFailureKind, StageError};
use crate::services::active_processes::ActiveProcessTable;
use crate::services::ffmpeg::{FfmpegProgress, FfmpegService};

pub enum TrimOutcome {
    Trimmed(PathBuf),
    AlreadyTrimmed(PathBuf),
}

pub struct Trimmer;

impl Trimmer {
    /// Compute `[0, intro_start) ∪ (intro_end, credits_start) ∪
    /// (credits_end, duration]`, minus any stinger ranges, as the set of
    /// ranges ffmpeg should keep.
    pub fn surviving_ranges(detection: &DetectionResultRecord, duration_secs: f64, remove_stingers: bool) -> Vec<(f64, f64)> {
        let mut cut_points: Vec<(f64, f64)> = Vec::new();

        if let (Some(start), Some(end)) = (detection.intro_start, detection.intro_end) {
            cut_points.push((start, end));
        }
        if let (Some(start), Some(end)) = (detection.credits_start, detection.credits_end) {
            cut_points.push((start, end));
        }
        if remove_stingers {
            if let Ok(stingers) = serde_json::from_value::<Vec<crate::db::detection_results::Interval>>(detection.stingers.clone()) {
                for interval in stingers {
                    cut_points.push((interval.start, interval.end));
                }
            }
        }

        cut_points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

        let mut keep = Vec::new();
        let mut cursor = 0.0;
        for (start, end) in cut_points {
            if start > cursor {
                keep.push((cursor, start));
            }
            cursor = cursor.max(end);
        }
        if cursor < duration_secs {
            keep.push((cursor, duration_secs));
        }
        keep.retain(|(s, e)| e > s);
        keep
    }

    /// Run the trim, writing to `output_path`. Backs up the original to
    /// `{output_dir}/.backup/...` first if `backup_originals`, restoring
    /// it on failure (spec §4.5). Idempotent: skips with
    /// `TrimOutcome::AlreadyTrimmed` if the output already exists and is
    /// newer than the source.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        ffmpeg: &FfmpegService,
        input_path: &Path,
        output_path: &Path,
        backup_path: Option<&Path>,
        keep_ranges: &[(f64, f64)],
        stream_copy: bool,
        backup_originals: bool,
        active_processes: &ActiveProcessTable,
        job_id: Uuid,
        episode_file_id: Uuid,
        mut on_progress: impl FnMut(FfmpegProgress) + Send,
    ) -> Result<TrimOutcome, StageError> {
        if already_trimmed(input_path, output_path).await {
            info!(output = %output_path.display(), "output already trimmed, skipping");
            return Ok(TrimOutcome::AlreadyTrimmed(output_path.to_path_buf()));
        }

        if backup_originals {
            if let Some(backup_path) = backup_path {
                if let Some(parent) = backup_path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| StageError::new(JobFailureKind::IoError, e.to_string()))?;
                }
                tokio::fs::copy(input_path, backup_path).await.map_err(|e| StageError::new(JobFailureKind::IoError, e.to_string()))?;
            }
        }

        let result = ffmpeg
            .trim_ranges(input_path, output_path, keep_ranges, stream_copy, active_processes, job_id, episode_file_id, &mut on_progress)
            .await;

        if result.is_err() {
            if backup_originals {
                if let Some(backup_path) = backup_path {
                    let _ = tokio::fs::copy(backup_path, input_path).await;
                }
            }
            return Err(result.unwrap_err());
        }

        Ok(TrimOutcome::Trimmed(output_path.to_path_buf()))
    }
}

async fn already_trimmed(input_path: &Path, output_path: &Path) -> bool {
    let (Ok(input_meta), Ok(output_meta)) = (tokio::fs::metadata(input_path).await, tokio::fs::metadata(output_path).await) else {
        return false;
    };
    let (Ok(input_mtime), Ok(output_mtime)) = (input_meta.modified(), output_meta.modified()) else {
        return false;
    };
    output_mtime > input_mtime
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::detection_results::{ApprovalStatus, DetectionResultRecord};
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn record(intro: Option<(f64, f64)>, credits: Option<(f64, f64)>) -> DetectionResultRecord {
        DetectionResultRecord {
            id: Uuid::nil(),
            show_id: Uuid::nil(),
            season_number: 1,
            episode_number: 1,
            intro_start: intro.map(|(s, _)| s),
            intro_end: intro.map(|(_, e)| e),
            credits_start: credits.map(|(s, _)| s),
            credits_end: credits.map(|(_, e)| e),
            stingers: serde_json::json!([]),
            segments: serde_json::json!([]),
            confidence_score: 1.0,
            detection_method: "hamming_cluster".to_string(),
            approval_status: ApprovalStatus::AutoApproved,
            processing_notes: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn surviving_ranges_excludes_intro_and_credits() {
        let detection = record(Some((0.0, 30.0)), Some((1380.0, 1440.0)));
        let ranges = Trimmer::surviving_ranges(&detection, 1440.0, false);
        assert_eq!(ranges, vec![(30.0, 1380.0)]);
    }

    #[test]
    fn surviving_ranges_with_no_detections_keeps_whole_file() {
        let detection = record(None, None);
        let ranges = Trimmer::surviving_ranges(&detection, 1440.0, false);
        assert_eq!(ranges, vec![(0.0, 1440.0)]);
    }
}

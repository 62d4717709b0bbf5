//! Stage 2: Audio Extractor
//!
//! Invokes FFmpeg to decode the primary audio track to mono 16-bit PCM
//! at a fixed sample rate into a scratch WAV (spec §4.2).

use std::path::{Path, PathBuf};

use tracing::info;
use uuid::Uuid;

use crate::config::PipelineTunables;
use crate::pipeline::error::{JobFailureKind, StageError};
use crate::services::active_processes::ActiveProcessTable;
use crate::services::ffmpeg::{FfmpegProgress, FfmpegService};

/// Bytes of headroom required beyond the estimated WAV size before
/// extraction is allowed to start (spec §4.2: "< required bytes + 10%").
const SPACE_HEADROOM_FRACTION: f64 = 0.10;

pub struct AudioExtractor;

impl AudioExtractor {
    pub fn wav_path(temp_dir: &Path, job_id: Uuid, episode_file_id: Uuid) -> PathBuf {
        temp_dir.join("audio").join(format!("{job_id}-{episode_file_id}.wav"))
    }

    /// Extract audio for `input_path`, writing to the job's scratch WAV.
    /// Idempotent: if the WAV already exists and is non-empty, returns
    /// immediately (spec §4.2 edge case).
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        ffmpeg: &FfmpegService,
        tunables: &PipelineTunables,
        temp_dir: &Path,
        input_path: &Path,
        job_id: Uuid,
        episode_file_id: Uuid,
        active_processes: &ActiveProcessTable,
        mut on_progress: impl FnMut(FfmpegProgress) + Send,
    ) -> Result<PathBuf, StageError> {
        let wav_path = Self::wav_path(temp_dir, job_id, episode_file_id);

        if let Ok(metadata) = tokio::fs::metadata(&wav_path).await {
            if metadata.len() > 0 {
                info!(job_id = %job_id, path = %wav_path.display(), "WAV already extracted, skipping");
                return Ok(wav_path);
            }
        }

        let analysis = ffmpeg.analyze(input_path).await.map_err(|e| StageError::new(JobFailureKind::ToolFailure, e.to_string()))?;
        if !analysis.has_audio_stream {
            return Err(StageError::new(JobFailureKind::NoAudioStream, "no audio stream found"));
        }

        let duration = analysis.duration_secs.unwrap_or(0.0);
        check_disk_space(temp_dir, duration, tunables.sample_rate_hz).await?;

        ffmpeg
            .extract_audio(
                input_path,
                &wav_path,
                tunables.sample_rate_hz,
                analysis.duration_secs,
                active_processes,
                job_id,
                episode_file_id,
                &mut on_progress,
            )
            .await?;

        Ok(wav_path)
    }
}

/// Estimate the raw PCM size (16-bit mono at `sample_rate_hz`) and verify
/// the temp directory's filesystem has at least that much plus 10% free.
async fn check_disk_space(temp_dir: &Path, duration_secs: f64, sample_rate_hz: u32) -> Result<(), StageError> {
    let estimated_bytes = (duration_secs * sample_rate_hz as f64 * 2.0) as u64; // 16-bit mono PCM
    let required = (estimated_bytes as f64 * (1.0 + SPACE_HEADROOM_FRACTION)) as u64;

    tokio::fs::create_dir_all(temp_dir).await.map_err(|e| StageError::new(JobFailureKind::IoError, e.to_string()))?;

    match available_space(temp_dir) {
        Some(available) if available < required => {
            Err(StageError::new(JobFailureKind::InsufficientSpace, format!("need {required} bytes, have {available}")))
        }
        _ => Ok(()), // platform without statvfs, or space check itself failed: don't block extraction spuriously
    }
}

#[cfg(unix)]
fn available_space(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    #[repr(C)]
    struct Statvfs {
        f_bsize: u64,
        f_frsize: u64,
        f_blocks: u64,
        f_bfree: u64,
        f_bavail: u64,
        _rest: [u64; 6],
    }

    unsafe extern "C" {
        fn statvfs(path: *const libc_char, buf: *mut Statvfs) -> i32;
    }

    type libc_char = std::os::raw::c_char;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat = MaybeUninit::<Statvfs>::uninit();
    let rc = unsafe { statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let stat = unsafe { stat.assume_init() };
    Some(stat.f_frsize * stat.f_bavail)
}

#[cfg(not(unix))]
fn available_space(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_path_encodes_job_and_file_ids() {
        let job_id = Uuid::nil();
        let episode_file_id = Uuid::nil();
        let path = AudioExtractor::wav_path(Path::new("/tmp"), job_id, episode_file_id);
        assert_eq!(path, PathBuf::from(format!("/tmp/audio/{job_id}-{episode_file_id}.wav")));
    }
}

//! Stage 3: Fingerprinter
//!
//! Runs `fpcalc` (Chromaprint) on each sliding window of a WAV, producing
//! an ordered `(window_start_seconds, hash)` sequence persisted in one
//! transaction (spec §4.3). Windowing is computed entirely by this
//! module; the fingerprint tool's own `-length` flag is never used (spec
//! §9, Open Questions decision 2), so the tool always sees exactly one
//! window's worth of audio per invocation.

use std::path::Path;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PipelineTunables;
use crate::db::Database;
use crate::pipeline::error::{JobFailureKind, StageError};
use crate::services::ffmpeg::FfmpegService;

#[derive(Deserialize)]
struct FpcalcOutput {
    fingerprint: String,
}

pub struct Fingerprinter {
    fpcalc_path: String,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self { fpcalc_path: "fpcalc".to_string() }
    }

    pub fn with_path(fpcalc_path: String) -> Self {
        Self { fpcalc_path }
    }

    async fn fingerprint_chunk(&self, chunk_wav: &Path) -> Result<Vec<u8>, StageError> {
        let output = Command::new(&self.fpcalc_path)
            .arg("-json")
            .arg(chunk_wav)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| StageError::new(JobFailureKind::ToolFailure, format!("failed to spawn fpcalc: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StageError::new(JobFailureKind::ToolFailure, format!("fpcalc failed: {}", stderr.trim())));
        }

        let parsed: FpcalcOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| StageError::new(JobFailureKind::FingerprintEmpty, format!("unparsable fpcalc output: {e}")))?;

        if parsed.fingerprint.is_empty() {
            return Err(StageError::new(JobFailureKind::FingerprintEmpty, "fpcalc emitted empty fingerprint"));
        }

        Ok(parsed.fingerprint.into_bytes())
    }

    /// Run the full windowing algorithm over `wav_path` and persist the
    /// resulting fingerprints for `episode_file_id`.
    pub async fn run(
        &self,
        db: &Database,
        ffmpeg: &FfmpegService,
        tunables: &PipelineTunables,
        episode_file_id: Uuid,
        job_id: Uuid,
        wav_path: &Path,
        chunk_dir: &Path,
    ) -> Result<(), StageError> {
        let analysis = ffmpeg
            .analyze(wav_path)
            .await
            .map_err(|e| StageError::new(JobFailureKind::ToolFailure, e.to_string()))?;
        let duration = analysis.duration_secs.unwrap_or(0.0);

        let windows = compute_windows(duration, tunables.window_secs, tunables.step_secs);

        let mut short_audio = false;
        let mut results = Vec::with_capacity(windows.len().max(1));

        if windows.is_empty() {
            // Audio shorter than one window: single fingerprint over the
            // whole clip (spec §4.3 edge case).
            short_audio = true;
            let chunk_path = chunk_dir.join("0.wav");
            ffmpeg.extract_chunk(wav_path, &chunk_path, 0.0, duration).await?;
            let hash = self.fingerprint_chunk(&chunk_path).await?;
            results.push((0.0, hash));
            let _ = tokio::fs::remove_file(&chunk_path).await;
        } else {
            for (index, (start, _end)) in windows.iter().enumerate() {
                let chunk_path = chunk_dir.join(format!("{index}.wav"));
                ffmpeg.extract_chunk(wav_path, &chunk_path, *start, tunables.window_secs).await?;
                let hash = self.fingerprint_chunk(&chunk_path).await?;
                results.push((*start, hash));
                let _ = tokio::fs::remove_file(&chunk_path).await;
            }
        }

        db.fingerprints()
            .replace_all(episode_file_id, &results)
            .await
            .map_err(|e| StageError::new(JobFailureKind::DatabaseError, e.to_string()))?;

        if short_audio {
            db.processing_jobs()
                .apply_patch(
                    job_id,
                    crate::db::processing_jobs::UpdateProcessingJob {
                        processing_notes: Some("short_audio".to_string()),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| StageError::new(JobFailureKind::DatabaseError, e.to_string()))?;
        }

        let _ = tokio::fs::remove_dir_all(chunk_dir).await;
        debug!(episode_file_id = %episode_file_id, windows = results.len(), "fingerprinting complete");
        Ok(())
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

/// Every `[t, t+window)` fully within `[0, duration)`, stepping by `step`.
pub fn compute_windows(duration_secs: f64, window_secs: f64, step_secs: f64) -> Vec<(f64, f64)> {
    if duration_secs < window_secs || window_secs <= 0.0 || step_secs <= 0.0 {
        return Vec::new();
    }

    let mut windows = Vec::new();
    let mut t = 0.0;
    while t + window_secs <= duration_secs {
        windows.push((t, t + window_secs));
        t += step_secs;
    }
    windows
}

/// Hamming distance between two equal-length byte strings, normalized to
/// `[0, 1]`. Unequal lengths are treated as maximally dissimilar (1.0)
/// rather than panicking, since a bit-width mismatch should never make
/// two fingerprints falsely "equivalent".
pub fn normalized_hamming(a: &[u8], b: &[u8]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }

    let differing_bits: u32 = a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum();
    let total_bits = (a.len() * 8) as f64;
    differing_bits as f64 / total_bits
}

/// Two hashes are "equivalent" iff their normalized Hamming distance is
/// at most `delta` (spec §4.3, default δ = 0.15). This predicate is the
/// detector's only notion of fingerprint similarity.
pub fn is_equivalent(a: &[u8], b: &[u8], delta: f64) -> bool {
    normalized_hamming(a, b) <= delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_cover_audio_with_overlap() {
        let windows = compute_windows(25.0, 10.0, 5.0);
        assert_eq!(windows, vec![(0.0, 10.0), (5.0, 15.0), (10.0, 20.0), (15.0, 25.0)]);
    }

    #[test]
    fn audio_shorter_than_window_yields_no_windows() {
        assert!(compute_windows(5.0, 10.0, 5.0).is_empty());
    }

    #[test]
    fn identical_hashes_have_zero_distance() {
        let hash = vec![0xAB, 0xCD, 0xEF];
        assert_eq!(normalized_hamming(&hash, &hash), 0.0);
        assert!(is_equivalent(&hash, &hash, 0.15));
    }

    #[test]
    fn single_differing_bit_is_within_delta() {
        let a = vec![0b0000_0000u8; 8];
        let mut b = a.clone();
        b[0] = 0b0000_0001;
        // 1 differing bit out of 64 = 1.5625%
        assert!(normalized_hamming(&a, &b) < 0.02);
        assert!(is_equivalent(&a, &b, 0.15));
    }

    #[test]
    fn mismatched_lengths_are_never_equivalent() {
        assert!(!is_equivalent(&[1, 2, 3], &[1, 2], 1.0));
    }
}

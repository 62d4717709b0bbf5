//! FFmpeg/ffprobe subprocess management
//!
//! Probing uses ffprobe's stable JSON output (teacher's approach); audio
//! extraction and trimming shell out to `ffmpeg` directly and parse
//! `-progress pipe:1` key=value lines for streaming progress, throttled
//! to at most one tick per 250 ms (spec §4.2).

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use uuid::Uuid;

use crate::pipeline::error::{JobFailureKind, StageError};
use crate::services::active_processes::{ActiveProcess, ActiveProcessTable};

const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(250);

/// The subset of a media file's shape the pipeline needs: whether it has
/// audio at all, and its duration (used for intro/credits search windows
/// and duration-variance detection).
#[derive(Debug, Clone, Deserialize)]
pub struct MediaAnalysis {
    pub duration_secs: Option<f64>,
    pub has_audio_stream: bool,
}

mod ffprobe {
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub format: Option<Format>,
        pub streams: Option<Vec<Stream>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        #[allow(dead_code)]
        pub tags: Option<HashMap<String, String>>,
    }
}

/// A single progress tick parsed from ffmpeg's `-progress` output.
#[derive(Debug, Clone, Copy)]
pub struct FfmpegProgress {
    pub percent: f32,
    pub fps: Option<f32>,
}

pub struct FfmpegService {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl FfmpegService {
    pub fn new() -> Self {
        Self { ffmpeg_path: "ffmpeg".to_string(), ffprobe_path: "ffprobe".to_string() }
    }

    pub fn with_paths(ffmpeg_path: String, ffprobe_path: String) -> Self {
        Self { ffmpeg_path, ffprobe_path }
    }

    pub async fn is_available(&self) -> bool {
        Command::new(&self.ffprobe_path)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Probe duration and audio-stream presence via ffprobe.
    pub async fn analyze(&self, path: &Path) -> Result<MediaAnalysis> {
        if !path.exists() {
            anyhow::bail!("file does not exist: {}", path.display());
        }

        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .output()
            .await
            .with_context(|| format!("failed to execute ffprobe for '{}'", path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ffprobe failed for '{}': {}", path.display(), stderr.trim());
        }

        let probe: ffprobe::FfprobeOutput =
            serde_json::from_slice(&output.stdout).context("failed to parse ffprobe JSON output")?;

        let duration_secs = probe.format.as_ref().and_then(|f| f.duration.as_ref()).and_then(|d| d.parse().ok());
        let has_audio_stream = probe
            .streams
            .as_ref()
            .map(|streams| streams.iter().any(|s| s.codec_type.as_deref() == Some("audio")))
            .unwrap_or(false);

        debug!(path = %path.display(), ?duration_secs, has_audio_stream, "probed media file");
        Ok(MediaAnalysis { duration_secs, has_audio_stream })
    }

    /// Extract the primary audio stream to mono 16-bit PCM WAV at
    /// `sample_rate_hz`, invoking `on_progress` at most every 250 ms
    /// (spec §4.2). Registers the spawned child in `active_processes` for
    /// the duration of the run so `cancel`/cleanup can kill it and
    /// `/processing/active-ffmpeg` can report it (spec §4.1, §4.7).
    #[allow(clippy::too_many_arguments)]
    pub async fn extract_audio(
        &self,
        input: &Path,
        output_wav: &Path,
        sample_rate_hz: u32,
        duration_secs: Option<f64>,
        active_processes: &ActiveProcessTable,
        job_id: Uuid,
        episode_file_id: Uuid,
        mut on_progress: impl FnMut(FfmpegProgress) + Send,
    ) -> Result<(), StageError> {
        if let Some(parent) = output_wav.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StageError::new(JobFailureKind::IoError, e.to_string()))?;
        }

        let mut child = Command::new(&self.ffmpeg_path)
            .args(["-y", "-i"])
            .arg(input)
            .args(["-vn", "-ac", "1", "-ar", &sample_rate_hz.to_string(), "-sample_fmt", "s16"])
            .args(["-progress", "pipe:1", "-nostats"])
            .arg(output_wav)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StageError::new(JobFailureKind::ToolFailure, format!("failed to spawn ffmpeg: {e}")))?;

        if let Some(pid) = child.id() {
            active_processes.register(ActiveProcess {
                episode_file_id,
                job_id,
                pid,
                file_path: input.display().to_string(),
            });
        }

        stream_progress(&mut child, duration_secs, &mut on_progress).await;

        let status = child.wait().await.map_err(|e| StageError::new(JobFailureKind::ToolFailure, e.to_string()))?;
        active_processes.unregister(job_id);
        if !status.success() {
            return Err(StageError::new(JobFailureKind::NoAudioStream, format!("ffmpeg exited with {status}")));
        }

        Ok(())
    }

    /// Slice `[start, start+length)` out of a WAV for one fingerprint
    /// window, written to `{temp_dir}/chunks/{job_id}/{window_index}.wav`
    /// (spec §6 filesystem layout). No progress reporting — chunks are
    /// sub-second operations.
    pub async fn extract_chunk(&self, input_wav: &Path, output_wav: &Path, start_secs: f64, length_secs: f64) -> Result<(), StageError> {
        if let Some(parent) = output_wav.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| StageError::new(JobFailureKind::IoError, e.to_string()))?;
        }

        let status = Command::new(&self.ffmpeg_path)
            .args(["-y", "-ss", &start_secs.to_string(), "-t", &length_secs.to_string(), "-i"])
            .arg(input_wav)
            .args(["-c", "copy"])
            .arg(output_wav)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| StageError::new(JobFailureKind::ToolFailure, format!("failed to spawn ffmpeg: {e}")))?;

        if !status.success() {
            return Err(StageError::new(JobFailureKind::ToolFailure, format!("chunk extraction exited with {status}")));
        }
        Ok(())
    }

    /// Build and run a trim that concatenates the surviving ranges via
    /// ffmpeg's `concat` demuxer-free `select`/`atrim` filter graph, using
    /// stream copy when `stream_copy` is true. Registers the spawned child
    /// in `active_processes` for the duration of the run (spec §4.1, §4.7).
    #[allow(clippy::too_many_arguments)]
    pub async fn trim_ranges(
        &self,
        input: &Path,
        output: &Path,
        keep_ranges: &[(f64, f64)],
        stream_copy: bool,
        active_processes: &ActiveProcessTable,
        job_id: Uuid,
        episode_file_id: Uuid,
        mut on_progress: impl FnMut(FfmpegProgress) + Send,
    ) -> Result<(), StageError> {
        if keep_ranges.is_empty() {
            return Err(StageError::new(JobFailureKind::TrimVerificationFailed, "no ranges survived trimming"));
        }

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StageError::new(JobFailureKind::IoError, e.to_string()))?;
        }

        let filter = build_concat_filter(keep_ranges);

        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-y", "-i"]).arg(input).args(["-filter_complex", &filter]).args(["-map", "[outv]", "-map", "[outa]"]);

        if stream_copy {
            cmd.args(["-c:v", "copy", "-c:a", "aac"]);
        } else {
            cmd.args(["-c:v", "libx264", "-preset", "medium", "-c:a", "aac"]);
        }

        cmd.args(["-progress", "pipe:1", "-nostats"]).arg(output).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child =
            cmd.spawn().map_err(|e| StageError::new(JobFailureKind::ToolFailure, format!("failed to spawn ffmpeg: {e}")))?;

        if let Some(pid) = child.id() {
            active_processes.register(ActiveProcess {
                episode_file_id,
                job_id,
                pid,
                file_path: input.display().to_string(),
            });
        }

        let total_duration = keep_ranges.iter().map(|(s, e)| e - s).sum::<f64>();
        stream_progress(&mut child, Some(total_duration), &mut on_progress).await;

        let status = child.wait().await.map_err(|e| StageError::new(JobFailureKind::ToolFailure, e.to_string()))?;
        active_processes.unregister(job_id);
        if !status.success() {
            return Err(StageError::new(JobFailureKind::ToolFailure, format!("ffmpeg trim exited with {status}")));
        }

        Ok(())
    }
}

impl Default for FfmpegService {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a `select`+`atrim` filter graph that keeps only `keep_ranges`
/// and concatenates the survivors, labeled `[outv]`/`[outa]`.
fn build_concat_filter(keep_ranges: &[(f64, f64)]) -> String {
    let mut video_parts = Vec::new();
    let mut audio_parts = Vec::new();
    let mut labels = Vec::new();

    for (i, (start, end)) in keep_ranges.iter().enumerate() {
        video_parts.push(format!("[0:v]trim=start={start}:end={end},setpts=PTS-STARTPTS[v{i}]"));
        audio_parts.push(format!("[0:a]atrim=start={start}:end={end},asetpts=PTS-STARTPTS[a{i}]"));
        labels.push(format!("[v{i}][a{i}]"));
    }

    let n = keep_ranges.len();
    format!(
        "{};{};{}concat=n={n}:v=1:a=1[outv][outa]",
        video_parts.join(";"),
        audio_parts.join(";"),
        labels.join("")
    )
}

/// Reads ffmpeg's `-progress pipe:1` key=value stream from the child's
/// stdout, converting `out_time_ms`/`fps` lines into `FfmpegProgress`
/// ticks, throttled to `PROGRESS_MIN_INTERVAL`.
async fn stream_progress(child: &mut Child, total_duration_secs: Option<f64>, on_progress: &mut (impl FnMut(FfmpegProgress) + Send)) {
    let Some(stdout) = child.stdout.take() else { return };
    let mut lines = BufReader::new(stdout).lines();

    let mut last_emit = Instant::now() - PROGRESS_MIN_INTERVAL;
    let mut out_time_ms: Option<i64> = None;
    let mut fps: Option<f32> = None;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(value) = line.strip_prefix("out_time_ms=") {
                    out_time_ms = value.trim().parse().ok();
                } else if let Some(value) = line.strip_prefix("fps=") {
                    fps = value.trim().parse().ok();
                }

                if line.starts_with("progress=") && last_emit.elapsed() >= PROGRESS_MIN_INTERVAL {
                    if let (Some(ms), Some(total)) = (out_time_ms, total_duration_secs) {
                        if total > 0.0 {
                            let percent = ((ms as f64 / 1000.0 / total) * 100.0).clamp(0.0, 100.0) as f32;
                            on_progress(FfmpegProgress { percent, fps });
                            last_emit = Instant::now();
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "error reading ffmpeg progress stream");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_concat_filter_chains_all_ranges() {
        let filter = build_concat_filter(&[(0.0, 30.0), (40.0, 1380.0)]);
        assert!(filter.contains("trim=start=0:end=30"));
        assert!(filter.contains("trim=start=40:end=1380"));
        assert!(filter.contains("concat=n=2:v=1:a=1[outv][outa]"));
    }
}

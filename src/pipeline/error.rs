//! Closed failure taxonomy for pipeline jobs (spec §4.1, §7)

use serde::{Deserialize, Serialize};

/// Every way a `ProcessingJob` can fail, stored verbatim in
/// `processing_jobs.failure_kind`. Closed over this enum (not a raw
/// string) so the orchestrator's retry policy stays exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobFailureKind {
    /// Source file vanished between scan and processing.
    FileMissing,
    /// ffprobe found no audio stream to extract.
    NoAudioStream,
    /// Extracted WAV decoded to zero usable fingerprint windows.
    FingerprintEmpty,
    /// Audio shorter than one fingerprint window.
    ShortAudio,
    /// ffmpeg/fpcalc exited non-zero or produced unparsable output.
    ToolFailure,
    /// A stage ran past its deadline (spec §4 "Timeouts").
    Timeout,
    /// Not enough free space in `temp_dir`/`output_directory` for extraction or trim.
    InsufficientSpace,
    /// The trim's post-check didn't match expectations (duration mismatch, zero-byte output).
    TrimVerificationFailed,
    /// A database operation failed after retries.
    DatabaseError,
    /// Any other I/O failure not covered above.
    IoError,
    /// Job was cancelled by an operator before it reached a terminal state.
    Cancelled,
}

impl JobFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobFailureKind::FileMissing => "file_missing",
            JobFailureKind::NoAudioStream => "no_audio_stream",
            JobFailureKind::FingerprintEmpty => "fingerprint_empty",
            JobFailureKind::ShortAudio => "short_audio",
            JobFailureKind::ToolFailure => "tool_failure",
            JobFailureKind::Timeout => "timeout",
            JobFailureKind::InsufficientSpace => "insufficient_space",
            JobFailureKind::TrimVerificationFailed => "trim_verification_failed",
            JobFailureKind::DatabaseError => "database_error",
            JobFailureKind::IoError => "io_error",
            JobFailureKind::Cancelled => "cancelled",
        }
    }

    /// Whether the orchestrator should re-enqueue this job with backoff
    /// rather than leaving it parked in `failed` (spec §4.1).
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            JobFailureKind::ToolFailure
                | JobFailureKind::Timeout
                | JobFailureKind::DatabaseError
                | JobFailureKind::IoError
        )
    }

    /// Retry ceiling for this failure kind, consulted instead of the
    /// orchestrator's general `max_retries` tunable. A bare subprocess
    /// failure is retried once and then fatal (spec §7); the rest use the
    /// configured `max_retries`.
    pub fn max_attempts(self, configured_max_retries: u32) -> u32 {
        match self {
            JobFailureKind::ToolFailure => 1,
            _ => configured_max_retries,
        }
    }
}

impl std::fmt::Display for JobFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stage-level error carrying enough context for the orchestrator to
/// decide retry vs. terminal failure and to write `processing_notes`.
#[derive(Debug)]
pub struct StageError {
    pub kind: JobFailureKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: JobFailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StageError {}

impl From<anyhow::Error> for StageError {
    fn from(e: anyhow::Error) -> Self {
        StageError::new(JobFailureKind::ToolFailure, e.to_string())
    }
}

//! Job Orchestrator & State Machine (spec §4.1)
//!
//! Owns the authoritative state of every `ProcessingJob`, dispatches
//! work across the five stage queues, and surfaces progress through the
//! `ProgressBroadcaster`. Stage workers never propagate errors to the
//! scheduler — they classify into `JobFailureKind` and record the
//! outcome on the job row themselves (spec §7 "Propagation policy").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::Database;
use crate::db::processing_jobs::{JobStatus, UpdateProcessingJob};
use crate::pipeline::cohort::CohortLocks;
use crate::pipeline::detector::{Detector, EpisodeFingerprints};
use crate::pipeline::error::{JobFailureKind, StageError};
use crate::pipeline::episode_processor::EpisodeProcessor;
use crate::pipeline::extractor::AudioExtractor;
use crate::pipeline::fingerprinter::Fingerprinter;
use crate::pipeline::stage_queue::{Broker, InProcessBroker};
use crate::pipeline::trimmer::{TrimOutcome, Trimmer};
use crate::services::active_processes::ActiveProcessTable;
use crate::services::ffmpeg::FfmpegService;
use crate::services::pools::WorkerPools;
use crate::services::progress::{ProgressBroadcaster, ProgressEvent, Stage};

const QUEUE_CAPACITY: usize = 4096;

/// The set of work the orchestrator dispatches to Stage 2-5's brokers.
/// Stage 1 runs inline on `submit` since it's a cheap existence check.
#[derive(Clone)]
struct JobRef {
    job_id: Uuid,
    episode_file_id: Uuid,
}

pub struct Orchestrator {
    db: Database,
    config: Config,
    pools: WorkerPools,
    broadcaster: ProgressBroadcaster,
    active_processes: ActiveProcessTable,
    ffmpeg: Arc<FfmpegService>,
    fingerprinter: Arc<Fingerprinter>,
    cohort_locks: CohortLocks,

    extract_queue: Arc<InProcessBroker<JobRef>>,
    fingerprint_queue: Arc<InProcessBroker<JobRef>>,
    trim_queue: Arc<InProcessBroker<JobRef>>,

    /// Per-job retry attempt counts, consulted against
    /// `PipelineTunables::max_retries` before giving up on a retryable
    /// failure (spec §4.1, §7). Cleared once a job reaches a terminal
    /// state or succeeds past the stage that failed.
    retry_counts: Mutex<HashMap<Uuid, u32>>,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        config: Config,
        pools: WorkerPools,
        broadcaster: ProgressBroadcaster,
        active_processes: ActiveProcessTable,
    ) -> Arc<Self> {
        let visibility_timeout = Duration::from_secs(config.pipeline.trim_deadline_secs.max(config.pipeline.extract_deadline_secs));

        Arc::new(Self {
            db,
            config,
            pools,
            broadcaster,
            active_processes,
            ffmpeg: Arc::new(FfmpegService::new()),
            fingerprinter: Arc::new(Fingerprinter::new()),
            cohort_locks: CohortLocks::new(),
            extract_queue: Arc::new(InProcessBroker::new(QUEUE_CAPACITY, 64, visibility_timeout)),
            fingerprint_queue: Arc::new(InProcessBroker::new(QUEUE_CAPACITY, 64, visibility_timeout)),
            trim_queue: Arc::new(InProcessBroker::new(QUEUE_CAPACITY, 64, visibility_timeout)),
            retry_counts: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the background worker loops for stages 2, 3 and 5, plus a
    /// periodic sweep of the cohort-ready predicate for stage 4 and a
    /// visibility-timeout sweep for every broker.
    pub fn spawn_workers(self: &Arc<Self>) {
        for _ in 0..self.pools.cpu.limit().max(1) {
            tokio::spawn(self.clone().extract_worker_loop());
            tokio::spawn(self.clone().fingerprint_worker_loop());
        }
        for _ in 0..self.pools.gpu.limit().max(1) {
            tokio::spawn(self.clone().trim_worker_loop());
        }
        tokio::spawn(self.clone().cohort_sweep_loop());
        tokio::spawn(self.clone().broker_sweep_loop());
    }

    // ---- Public contract (spec §4.1) ----------------------------------

    /// Idempotent: returns the existing active job for this file if one
    /// exists, otherwise creates one and enqueues Stage 2.
    pub async fn submit(&self, episode_file_id: Uuid) -> anyhow::Result<Uuid> {
        let job = self.db.processing_jobs().submit(episode_file_id).await?;
        self.enqueue_extract(job.id, episode_file_id).await;
        Ok(job.id)
    }

    /// Remove from all stage queues (best-effort — the in-process broker
    /// has no per-item cancel, so an in-flight pickup still completes but
    /// its subprocess is killed), kill any attached subprocess, unlink
    /// scratch files, and mark `failed` with reason `cancelled`.
    pub async fn cancel(&self, job_id: Uuid) -> anyhow::Result<()> {
        self.active_processes.terminate(job_id);

        if let Some(job) = self.db.processing_jobs().get(job_id).await? {
            if !job.status.is_terminal() {
                self.db.processing_jobs().mark_failed(job_id, JobFailureKind::Cancelled.as_str(), Some("cancelled by operator")).await?;
            }

            let wav_path = AudioExtractor::wav_path(std::path::Path::new(&self.config.temp_dir), job_id, job.episode_file_id);
            let _ = tokio::fs::remove_file(&wav_path).await;
        }

        self.retry_counts.lock().remove(&job_id);
        Ok(())
    }

    /// Deletes this job's fingerprints and resets to `scanning`, ready
    /// for a fresh `submit`.
    pub async fn requeue(&self, job_id: Uuid) -> anyhow::Result<()> {
        if let Some(job) = self.db.processing_jobs().get(job_id).await? {
            self.db.fingerprints().delete_for_episode_file(job.episode_file_id).await?;
            self.db.processing_jobs().reset_to_scanning(job_id).await?;
            self.retry_counts.lock().remove(&job_id);
            self.enqueue_extract(job_id, job.episode_file_id).await;
        }
        Ok(())
    }

    /// Apply an operator patch (`PUT /processing/jobs/{id}`) and, if it
    /// newly transitions the job into `verified` (manual approval),
    /// enqueue Stage 5 the same way auto-approval does (spec §4.1
    /// `verified -> trimming`). Only fires on the transition itself, so
    /// re-patching an already-verified job doesn't double-enqueue the trim.
    pub async fn apply_patch(&self, job_id: Uuid, patch: UpdateProcessingJob) -> anyhow::Result<crate::db::processing_jobs::ProcessingJobRecord> {
        let was_verified = self.db.processing_jobs().get(job_id).await?.map(|j| j.status == JobStatus::Verified).unwrap_or(false);

        let record = self.db.processing_jobs().apply_patch(job_id, patch).await?;

        if !was_verified && record.status == JobStatus::Verified {
            self.trim_queue.push(JobRef { job_id: record.id, episode_file_id: record.episode_file_id }).await;
        }

        Ok(record)
    }

    async fn enqueue_extract(&self, job_id: Uuid, episode_file_id: Uuid) {
        match EpisodeProcessor::resolve(&self.db, episode_file_id).await {
            Ok(_path) => {
                let _ = self.db.processing_jobs().set_status(job_id, JobStatus::ExtractingAudio).await;
                self.extract_queue.push(JobRef { job_id, episode_file_id }).await;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "episode processor rejected job");
                let _ = self.db.processing_jobs().mark_failed(job_id, e.kind.as_str(), Some(&e.message)).await;
            }
        }
    }

    // ---- Stage 2: Audio Extractor --------------------------------------

    async fn extract_worker_loop(self: Arc<Self>) {
        loop {
            let Some(delivery) = self.extract_queue.pull().await else { continue };
            let _permit = self.pools.cpu.acquire().await;
            let job_ref = delivery.item.clone();
            self.run_extract(&job_ref).await;
            self.extract_queue.ack(delivery.receipt).await;
        }
    }

    async fn run_extract(&self, job_ref: &JobRef) {
        let Ok(Some(context)) = self.db.episode_files().get_with_context(job_ref.episode_file_id).await else {
            let _ = self
                .db
                .processing_jobs()
                .mark_failed(job_ref.job_id, JobFailureKind::FileMissing.as_str(), Some("episode file context missing"))
                .await;
            return;
        };

        let job_id = job_ref.job_id;
        let episode_file_id = job_ref.episode_file_id;
        let broadcaster = self.broadcaster.clone();
        let path = context.path.clone();

        let result = AudioExtractor::run(
            &self.ffmpeg,
            &self.config.pipeline,
            std::path::Path::new(&self.config.temp_dir),
            std::path::Path::new(&context.path),
            job_id,
            episode_file_id,
            &self.active_processes,
            move |progress| {
                broadcaster.publish_progress(ProgressEvent {
                    job_id,
                    episode_file_id,
                    file_path: path.clone(),
                    stage: Stage::AudioExtractor,
                    percent: progress.percent,
                    fps: progress.fps,
                    status: "extracting".to_string(),
                    timestamp: OffsetDateTime::now_utc(),
                });
            },
        )
        .await;

        match result {
            Ok(_wav_path) => {
                self.retry_counts.lock().remove(&job_id);
                let _ = self.db.processing_jobs().set_status(job_id, JobStatus::Fingerprinting).await;
                self.fingerprint_queue.push(job_ref.clone()).await;
            }
            Err(e) => self.handle_stage_failure(job_ref, e, &self.extract_queue).await,
        }
    }

    // ---- Stage 3: Fingerprinter -----------------------------------------

    async fn fingerprint_worker_loop(self: Arc<Self>) {
        loop {
            let Some(delivery) = self.fingerprint_queue.pull().await else { continue };
            let _permit = self.pools.cpu.acquire().await;
            let job_ref = delivery.item.clone();
            self.run_fingerprint(&job_ref).await;
            self.fingerprint_queue.ack(delivery.receipt).await;
        }
    }

    async fn run_fingerprint(&self, job_ref: &JobRef) {
        let wav_path = AudioExtractor::wav_path(std::path::Path::new(&self.config.temp_dir), job_ref.job_id, job_ref.episode_file_id);
        let chunk_dir = std::path::Path::new(&self.config.temp_dir).join("chunks").join(job_ref.job_id.to_string());

        let result = self
            .fingerprinter
            .run(&self.db, &self.ffmpeg, &self.config.pipeline, job_ref.episode_file_id, job_ref.job_id, &wav_path, &chunk_dir)
            .await;

        match result {
            Ok(()) => {
                self.retry_counts.lock().remove(&job_ref.job_id);
                let _ = self.db.processing_jobs().set_status(job_ref.job_id, JobStatus::AwaitingCohort).await;
                info!(job_id = %job_ref.job_id, "fingerprinting complete, awaiting cohort");
            }
            Err(e) => self.handle_stage_failure(job_ref, e, &self.fingerprint_queue).await,
        }
    }

    // ---- Stage 4: Detector / Clusterer ----------------------------------

    /// Periodically sweeps every show/season that has jobs in
    /// `awaiting_cohort`, running detection once the cohort-ready
    /// predicate holds (spec §4.4).
    async fn cohort_sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_cohorts().await {
                error!(error = %e, "cohort sweep failed");
            }
        }
    }

    async fn sweep_cohorts(&self) -> anyhow::Result<()> {
        // Filtered by status and unbounded in SQL rather than the default
        // 100-row page, so a large library never hides a waiting cohort.
        let waiting = self
            .db
            .processing_jobs()
            .list(crate::db::processing_jobs::JobListFilter { status: Some(JobStatus::AwaitingCohort), limit: Some(i64::MAX) })
            .await?;
        let mut cohorts: std::collections::HashSet<(Uuid, i32)> = std::collections::HashSet::new();

        for job in &waiting {
            if let Some(context) = self.db.episode_files().get_with_context(job.episode_file_id).await? {
                cohorts.insert((context.show_id, context.season_number));
            }
        }

        for (show_id, season_number) in cohorts {
            self.try_detect_cohort(show_id, season_number).await?;
        }
        Ok(())
    }

    async fn try_detect_cohort(&self, show_id: Uuid, season_number: i32) -> anyhow::Result<()> {
        let files = self.db.episode_files().list_with_context_for_cohort(show_id, season_number).await?;
        let cohort_size = files.len();

        let mut ready_count = 0;
        let mut most_recent_update = OffsetDateTime::UNIX_EPOCH;
        let mut ready_episodes = Vec::new();

        for file in &files {
            let Some(job) = self.db.processing_jobs().get_by_episode_file(file.episode_file_id).await? else { continue };
            let past_fingerprinting = matches!(
                job.status,
                JobStatus::AwaitingCohort
                    | JobStatus::Detecting
                    | JobStatus::Detected
                    | JobStatus::Verified
                    | JobStatus::Trimming
                    | JobStatus::Completed
            );
            if past_fingerprinting {
                ready_count += 1;
            }
            if job.updated_at > most_recent_update {
                most_recent_update = job.updated_at;
            }
            if job.status == JobStatus::AwaitingCohort {
                ready_episodes.push(file.clone());
            }
        }

        let seconds_since_update = (OffsetDateTime::now_utc() - most_recent_update).whole_seconds().max(0) as u64;
        if !Detector::is_cohort_ready(cohort_size, ready_count, seconds_since_update, &self.config.pipeline) {
            return Ok(());
        }

        let _guard = self.cohort_locks.lock(show_id, season_number).await;

        for file in &ready_episodes {
            if let Some(job) = self.db.processing_jobs().get_by_episode_file(file.episode_file_id).await? {
                let _ = self.db.processing_jobs().set_status(job.id, JobStatus::Detecting).await;
            }
        }

        self.run_detection(show_id, season_number, &files).await
    }

    async fn run_detection(
        &self,
        show_id: Uuid,
        season_number: i32,
        files: &[crate::db::episodes::EpisodeFileWithContext],
    ) -> anyhow::Result<()> {
        let mut episodes = Vec::with_capacity(files.len());
        for file in files {
            let fingerprints = self.db.fingerprints().list_by_episode_file(file.episode_file_id).await?;
            if fingerprints.is_empty() {
                continue;
            }
            episodes.push(EpisodeFingerprints {
                episode_file_id: file.episode_file_id,
                episode_number: file.episode_number,
                windows: fingerprints.into_iter().map(|f| (f.window_start_seconds, f.hash)).collect(),
            });
        }

        if episodes.is_empty() {
            return Ok(());
        }

        let detection = Detector::detect(&episodes, &self.config.pipeline);

        let mut tx = self.db.detection_results().pool().begin().await?;
        for (file, episode) in files.iter().zip(episodes.iter()) {
            let input = Detector::per_episode_result(
                &detection,
                show_id,
                season_number,
                episode,
                &self.config.pipeline,
                self.config.auto_process_verified,
                self.config.min_confidence_threshold,
            );
            let record = self.db.detection_results().upsert(&mut tx, input).await?;

            if let Some(job) = self.db.processing_jobs().get_by_episode_file(file.episode_file_id).await? {
                let next_status = if record.approval_status == crate::db::detection_results::ApprovalStatus::AutoApproved {
                    JobStatus::Verified
                } else {
                    JobStatus::Detected
                };
                self.db.processing_jobs().apply_patch(
                    job.id,
                    UpdateProcessingJob {
                        status: Some(next_status),
                        confidence_score: Some(record.confidence_score),
                        intro_start: record.intro_start,
                        intro_end: record.intro_end,
                        credits_start: record.credits_start,
                        credits_end: record.credits_end,
                        processing_notes: record.processing_notes.clone(),
                        ..Default::default()
                    },
                )
                .await?;

                if next_status == JobStatus::Verified {
                    self.trim_queue.push(JobRef { job_id: job.id, episode_file_id: file.episode_file_id }).await;
                }
            }
        }
        tx.commit().await?;

        info!(show_id = %show_id, season_number, confidence = detection.confidence_score, "cohort detection complete");
        Ok(())
    }

    // ---- Stage 5: Trimmer -----------------------------------------------

    async fn trim_worker_loop(self: Arc<Self>) {
        loop {
            let Some(delivery) = self.trim_queue.pull().await else { continue };
            let _permit = self.pools.gpu.acquire().await;
            let job_ref = delivery.item.clone();
            self.run_trim(&job_ref).await;
            self.trim_queue.ack(delivery.receipt).await;
        }
    }

    async fn run_trim(&self, job_ref: &JobRef) {
        let _ = self.db.processing_jobs().set_status(job_ref.job_id, JobStatus::Trimming).await;

        let result = self.run_trim_inner(job_ref).await;
        match result {
            Ok(()) => {
                self.retry_counts.lock().remove(&job_ref.job_id);
                let _ = self.db.processing_jobs().set_status(job_ref.job_id, JobStatus::Completed).await;
            }
            Err(e) => self.handle_stage_failure(job_ref, e, &self.trim_queue).await,
        }
    }

    async fn run_trim_inner(&self, job_ref: &JobRef) -> Result<(), StageError> {
        let context = self
            .db
            .episode_files()
            .get_with_context(job_ref.episode_file_id)
            .await
            .map_err(|e| StageError::new(JobFailureKind::DatabaseError, e.to_string()))?
            .ok_or_else(|| StageError::new(JobFailureKind::FileMissing, "episode file missing"))?;

        let detection = self
            .db
            .detection_results()
            .get(context.show_id, context.season_number, context.episode_number)
            .await
            .map_err(|e| StageError::new(JobFailureKind::DatabaseError, e.to_string()))?
            .ok_or_else(|| StageError::new(JobFailureKind::ToolFailure, "no detection result to trim"))?;

        let analysis = self
            .ffmpeg
            .analyze(std::path::Path::new(&context.path))
            .await
            .map_err(|e| StageError::new(JobFailureKind::ToolFailure, e.to_string()))?;
        let duration = analysis.duration_secs.unwrap_or(0.0);

        let keep_ranges = Trimmer::surviving_ranges(&detection, duration, false);

        let output_path = std::path::Path::new(&self.config.output_directory).join(&context.path);
        let backup_path = std::path::Path::new(&self.config.output_directory).join(".backup").join(&context.path);

        let job_id = job_ref.job_id;
        let episode_file_id = job_ref.episode_file_id;
        let broadcaster = self.broadcaster.clone();
        let file_path = context.path.clone();

        let outcome = Trimmer::run(
            &self.ffmpeg,
            std::path::Path::new(&context.path),
            &output_path,
            Some(&backup_path),
            &keep_ranges,
            true,
            self.config.backup_originals,
            &self.active_processes,
            job_id,
            episode_file_id,
            move |progress| {
                broadcaster.publish_progress(ProgressEvent {
                    job_id,
                    episode_file_id,
                    file_path: file_path.clone(),
                    stage: Stage::Trimmer,
                    percent: progress.percent,
                    fps: progress.fps,
                    status: "trimming".to_string(),
                    timestamp: OffsetDateTime::now_utc(),
                });
            },
        )
        .await?;

        match outcome {
            TrimOutcome::Trimmed(_) | TrimOutcome::AlreadyTrimmed(_) => Ok(()),
        }
    }

    // ---- Shared failure handling -----------------------------------------

    /// On a retryable failure, re-enqueue onto the same stage's queue with
    /// exponential backoff as long as `max_retries` hasn't been exhausted
    /// (spec §4.1, §7). Otherwise (or once exhausted) parks the job in
    /// `failed` with its `JobFailureKind`.
    async fn handle_stage_failure(&self, job_ref: &JobRef, error: StageError, queue: &Arc<InProcessBroker<JobRef>>) {
        warn!(job_id = %job_ref.job_id, kind = %error.kind, message = %error.message, "stage failed");

        if error.kind.is_retryable() {
            let attempt = {
                let mut counts = self.retry_counts.lock();
                let entry = counts.entry(job_ref.job_id).or_insert(0);
                *entry += 1;
                *entry
            };

            if attempt <= error.kind.max_attempts(self.config.pipeline.max_retries) {
                let backoff = Duration::from_secs(2u64.saturating_pow(attempt).min(60));
                let job_ref = job_ref.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    queue.push(job_ref).await;
                });
                return;
            }
        }

        self.retry_counts.lock().remove(&job_ref.job_id);
        let _ = self.db.processing_jobs().mark_failed(job_ref.job_id, error.kind.as_str(), Some(&error.message)).await;
    }

    async fn broker_sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            self.extract_queue.sweep_expired().await;
            self.fingerprint_queue.sweep_expired().await;
            self.trim_queue.sweep_expired().await;
        }
    }
}

//! Application configuration management

use std::env;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
///
/// The PVR connection details are stored but never dialed by this crate —
/// the import client is an external collaborator (see spec §1); everything
/// else here drives the pipeline directly.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// Postgres connection string for the job store.
    pub database_url: String,

    pub sonarr_url: Option<String>,
    pub sonarr_api_key: Option<String>,

    pub output_directory: String,
    pub temp_dir: String,

    pub min_confidence_threshold: f64,
    pub backup_originals: bool,
    pub auto_process_verified: bool,
    pub auto_process_detections: bool,
    pub import_mode: ImportMode,
    pub polling_interval_secs: u64,

    pub cpu_worker_limit: usize,
    pub gpu_worker_limit: usize,

    pub pipeline: PipelineTunables,
}

/// Import mode for the (external) PVR collaborator; stored only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    Auto,
    Import,
    None,
}

impl std::str::FromStr for ImportMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "import" => Ok(Self::Import),
            "none" => Ok(Self::None),
            other => anyhow::bail!("invalid import_mode: {other}"),
        }
    }
}

/// Windowing and clustering constants the detector and fingerprinter use.
///
/// Kept configurable rather than hardcoded so operators can retune without
/// a rebuild; the defaults match the spec exactly.
#[derive(Debug, Clone, Copy)]
pub struct PipelineTunables {
    pub window_secs: f64,
    pub step_secs: f64,
    pub hamming_delta: f64,
    pub cohort_tau: f64,
    pub cohort_min_episodes: usize,
    pub cohort_debounce_secs: u64,
    pub sample_rate_hz: u32,
    pub merge_gap_secs: f64,
    pub min_segment_secs: f64,
    pub intro_search_fraction: f64,
    pub intro_search_cap_secs: f64,
    pub credits_search_fraction: f64,
    pub credits_search_cap_secs: f64,
    pub max_retries: u32,
    pub extract_deadline_secs: u64,
    pub fingerprint_deadline_secs: u64,
    pub trim_deadline_secs: u64,
}

impl Default for PipelineTunables {
    fn default() -> Self {
        Self {
            window_secs: 10.0,
            step_secs: 5.0,
            hamming_delta: 0.15,
            cohort_tau: 0.6,
            cohort_min_episodes: 3,
            cohort_debounce_secs: 30,
            sample_rate_hz: 44_100,
            merge_gap_secs: 10.0,
            min_segment_secs: 10.0,
            intro_search_fraction: 0.2,
            intro_search_cap_secs: 180.0,
            credits_search_fraction: 0.2,
            credits_search_cap_secs: 180.0,
            max_retries: 3,
            extract_deadline_secs: 30 * 60,
            fingerprint_deadline_secs: 30 * 60,
            trim_deadline_secs: 60 * 60,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),

            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("invalid PORT")?,

            database_url: env::var("DATABASE_URL").context("DATABASE_URL is required")?,

            sonarr_url: env::var("SONARR_URL").ok(),
            sonarr_api_key: env::var("SONARR_API_KEY").ok(),

            output_directory: env::var("OUTPUT_DIRECTORY")
                .unwrap_or_else(|_| "./data/output".to_string()),
            temp_dir: env::var("TEMP_DIR").unwrap_or_else(|_| "./data/tmp".to_string()),

            min_confidence_threshold: env::var("MIN_CONFIDENCE_THRESHOLD")
                .unwrap_or_else(|_| "0.6".to_string())
                .parse()
                .context("invalid MIN_CONFIDENCE_THRESHOLD")?,

            backup_originals: env::var("BACKUP_ORIGINALS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),

            auto_process_verified: env::var("AUTO_PROCESS_VERIFIED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),

            auto_process_detections: env::var("AUTO_PROCESS_DETECTIONS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),

            import_mode: env::var("IMPORT_MODE")
                .unwrap_or_else(|_| "none".to_string())
                .parse()
                .unwrap_or(ImportMode::None),

            polling_interval_secs: env::var("POLLING_INTERVAL")
                .unwrap_or_else(|_| "900".to_string())
                .parse()
                .map(|v: u64| v.clamp(60, 86_400))
                .unwrap_or(900),

            cpu_worker_limit: env::var("CPU_WORKER_LIMIT")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .map(|v: usize| v.clamp(0, 16))
                .unwrap_or(2),

            gpu_worker_limit: env::var("GPU_WORKER_LIMIT")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .map(|v: usize| v.clamp(0, 8))
                .unwrap_or(1),

            pipeline: PipelineTunables::default(),
        })
    }
}

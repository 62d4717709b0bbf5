//! Cliparr — fingerprint-and-detection pipeline for trimming repeated
//! TV segments (intros, credits, stingers) across a season.
//!
//! All operations are exposed via REST at `/api` (spec §6); there is no
//! query language on top.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod pvr;
pub mod services;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, ImportMode};
use crate::db::Database;
use crate::pipeline::Orchestrator;
use crate::pvr::{PvrImport, StubPvrImport};
use crate::services::{ActiveProcessTable, CleanupService, ProgressBroadcaster, WorkerPools};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub orchestrator: Arc<Orchestrator>,
    pub pools: WorkerPools,
    pub broadcaster: ProgressBroadcaster,
    pub active_processes: ActiveProcessTable,
    pub cleanup: Arc<CleanupService>,
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cliparr=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let config = Arc::new(config);

    info!("starting cliparr");

    eprintln!("Connecting to database...");
    let db = Database::connect_with_retry(&config.database_url, Duration::from_secs(30)).await;
    eprintln!("Database connected!");

    eprintln!("Running database migrations...");
    if let Err(e) = db.migrate().await {
        eprintln!("Failed to run migrations: {e}");
        std::process::exit(1);
    }
    eprintln!("Migrations complete!");

    let pools = WorkerPools::new(config.cpu_worker_limit, config.gpu_worker_limit);
    let broadcaster = ProgressBroadcaster::default();
    let active_processes = ActiveProcessTable::new();

    let orchestrator = Orchestrator::new(
        db.clone(),
        (*config).clone(),
        pools.clone(),
        broadcaster.clone(),
        active_processes.clone(),
    );
    orchestrator.spawn_workers();
    info!("pipeline orchestrator started");

    let cleanup = Arc::new(CleanupService::new(
        db.clone(),
        pools.clone(),
        active_processes.clone(),
        broadcaster.clone(),
        config.temp_dir.clone(),
    ));

    if config.import_mode != ImportMode::None {
        spawn_pvr_poller(db.clone(), orchestrator.clone(), config.clone());
    }

    let state = AppState {
        config: config.clone(),
        db,
        orchestrator,
        pools,
        broadcaster,
        active_processes,
        cleanup,
    };

    let app = Router::new()
        .merge(api::health::router())
        .nest("/api", api::shows::router())
        .nest("/api", api::jobs::router())
        .nest("/api", api::queue::router())
        .nest("/api", api::ws::router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Polls the PVR-import stub every `polling_interval_secs` and submits
/// whatever it discovers (spec §1, §6 "import_mode").
fn spawn_pvr_poller(db: Database, orchestrator: Arc<Orchestrator>, config: Arc<Config>) {
    let importer = StubPvrImport::new(db);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(config.polling_interval_secs));
        loop {
            ticker.tick().await;
            match importer.discover().await {
                Ok(episode_file_ids) => {
                    for episode_file_id in episode_file_ids {
                        if let Err(e) = orchestrator.submit(episode_file_id).await {
                            warn!(%episode_file_id, error = %e, "pvr poller failed to submit job");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "pvr import discovery failed"),
            }
        }
    });
}

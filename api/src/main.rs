mod config;
mod constants;
mod domain;
mod models;
mod routes;
mod services;
mod storage;
mod sweeper;
mod worker;

use axum::extract::DefaultBodyLimit;
use google_cloud_storage::client::Storage;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use domain::assets::{AssetRepository, PgAssetRepository};
use domain::jobs::JobStore;
use domain::merge::MergeCommitter;
use domain::uploads::UploadSessionManager;
use services::kv::{KvStore, PgKvStore};
use services::plans::PgPlanLookup;
use services::probe::FfmpegProbe;
use services::throttle::ChunkThrottle;
use services::transcriber::HttpTranscriber;
use storage::{BlobStore, GcsBlobStore, LocalBlobStore};
use sweeper::SweepContext;
use worker::{JobDispatcher, JobRunner, SpawnDispatcher};

/// Multipart framing around one chunk
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub struct AppState {
    uploads: Arc<UploadSessionManager>,
    committer: Arc<MergeCommitter>,
    jobs: Arc<JobStore>,
    dispatcher: Arc<dyn JobDispatcher>,
    assets: Arc<dyn AssetRepository>,
    blobs: Arc<dyn BlobStore>,
    throttle: Arc<ChunkThrottle>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    let pool = services::db::connect(&config.database_url).await?;

    let blobs: Arc<dyn BlobStore> = match &config.local_storage_path {
        Some(path) => {
            info!(path = %path.display(), "using local blob storage");
            Arc::new(LocalBlobStore::new(path.clone()))
        }
        None => {
            // GCS client uses GOOGLE_APPLICATION_CREDENTIALS env var
            let gcs = Storage::builder().build().await?;
            info!(bucket = %config.bucket_name, "using GCS blob storage");
            Arc::new(GcsBlobStore::new(gcs, config.bucket_name.clone()))
        }
    };

    let store: Arc<dyn KvStore> = Arc::new(PgKvStore::new(pool.clone()));
    let assets: Arc<dyn AssetRepository> = Arc::new(PgAssetRepository::new(pool.clone()));

    let uploads = Arc::new(UploadSessionManager::new(
        store.clone(),
        blobs.clone(),
        Arc::new(PgPlanLookup::new(pool.clone())),
        assets.clone(),
        config.session_ttl,
    ));
    let committer = Arc::new(MergeCommitter::new(
        uploads.clone(),
        Some(Arc::new(FfmpegProbe::new(blobs.clone()))),
    ));

    if config.transcriber_api_key.is_none() {
        warn!("TRANSCRIBER_API_KEY is not set; transcription requests will be unauthenticated");
    }
    let transcriber = Arc::new(HttpTranscriber::new(
        &config.transcriber_base_url,
        config.transcriber_api_key.clone(),
        config.transcriber_poll_interval,
    ));

    let jobs = Arc::new(JobStore::new(store, config.job_retention));
    let runner = Arc::new(JobRunner::new(
        jobs.clone(),
        assets.clone(),
        blobs.clone(),
        transcriber,
        config.transcription_timeout,
        config.signed_url_expiry_secs,
    ));

    let throttle = Arc::new(ChunkThrottle::new(config.chunk_throttle));

    let sweep_ctx = SweepContext {
        sessions: uploads.clone(),
        jobs: jobs.clone(),
        throttle: throttle.clone(),
        job_lease: chrono::Duration::seconds(config.job_lease_seconds),
    };
    let sweep_pool = pool.clone();
    let sweep_seconds = config.sweep_cron_seconds;
    tokio::spawn(async move {
        if let Err(e) = sweeper::run_sweeper(sweep_pool, sweep_ctx, sweep_seconds).await {
            error!(error = %e, "sweep worker stopped");
        }
    });

    let state = Arc::new(AppState {
        uploads,
        committer,
        jobs,
        dispatcher: Arc::new(SpawnDispatcher::new(runner)),
        assets,
        blobs,
        throttle,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::build_routes()
        .layer(DefaultBodyLimit::max(config.max_chunk_size + MULTIPART_OVERHEAD))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use detect_dedup::{
    app_state::AppState,
    config::AppConfig,
    routes,
    services::{
        coordinator::SubmissionCoordinator,
        executor::{JobRecords, QueueJobExecutor},
        kv::{KeyValueStore, RedisKv},
        queue::JobQueue,
        storage::{BlobStore, R2Client},
    },
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing detect-dedup server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!(
        "detect_submissions_total",
        "Detection submissions by outcome (cached, joined, submitted, race_lost)"
    );
    metrics::describe_counter!(
        "detect_stale_index_total",
        "Finished jobs whose index entry had expired, so nothing was cached"
    );

    // Key-value backend for result cache, inflight map, job index and job records
    tracing::info!("Connecting to Redis");
    let kv: Arc<dyn KeyValueStore> = Arc::new(
        RedisKv::new(&config.redis_url, config.kv_timeout()).expect("Failed to initialize Redis store"),
    );

    // Uploads happen while the client waits, so they get the short policy.
    tracing::info!("Initializing R2 storage client");
    let storage: Arc<dyn BlobStore> = Arc::new(
        R2Client::new(
            &config.r2_bucket,
            &config.r2_endpoint,
            &config.r2_access_key,
            &config.r2_secret_key,
            config.upload_policy(),
        )
        .expect("Failed to initialize R2 client"),
    );

    let queue = JobQueue::new(&config.redis_url, &config.key_prefix, config.kv_timeout())
        .expect("Failed to initialize job queue");
    let executor = Arc::new(QueueJobExecutor::new(
        queue,
        JobRecords::new(kv.clone(), &config.key_prefix, config.job_record_ttl()),
    ));

    let coordinator = SubmissionCoordinator::new(
        kv.clone(),
        storage.clone(),
        executor,
        &config.coordinator_settings(),
    );

    let state = AppState::new(coordinator, kv, storage);
    let app = routes::router(state, prometheus_handle);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Server stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining connections");
}

pub mod detect;
pub mod error;
pub mod health;

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// Upload size limit for a single image.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// API routes, without the metrics endpoint.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/detect", post(detect::submit_detection))
        .route("/api/v1/detect/{job_id}", get(detect::get_job_status))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(RequestBodyLimitLayer::new(MAX_UPLOAD_BYTES))
}

/// Full application: API plus the Prometheus scrape endpoint.
pub fn router(state: AppState, prometheus: Arc<PrometheusHandle>) -> Router {
    api_router(state)
        .route(
            "/metrics",
            get(|State(handle): State<Arc<PrometheusHandle>>| async move { handle.render() })
                .with_state(prometheus),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}

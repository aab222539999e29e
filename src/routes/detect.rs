use axum::extract::{Multipart, Path, State};
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::detect::{DetectResponse, JobStatusResponse};
use crate::routes::error::ApiError;

/// POST /api/v1/detect: Upload an image for object detection.
///
/// Identical images are answered from cache or attached to the job already
/// computing them.
pub async fn submit_detection(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<DetectResponse>, ApiError> {
    let mut image_data: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() == Some("image") {
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            image_data = Some(data.to_vec());
        }
    }

    let image_data =
        image_data.ok_or_else(|| ApiError::BadRequest("No image file provided".to_string()))?;

    // Empty uploads are rejected by the coordinator before fingerprinting.
    if !image_data.is_empty() {
        image::guess_format(&image_data)
            .map_err(|e| ApiError::UnsupportedMediaType(e.to_string()))?;
    }

    let outcome = state.coordinator.submit_or_join(&image_data).await?;
    Ok(Json(DetectResponse::from(outcome)))
}

/// GET /api/v1/detect/{job_id}: Check detection job status.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let outcome = state.coordinator.finalize_on_poll(job_id).await?;
    Ok(Json(JobStatusResponse::from(outcome)))
}

//! HTTP surface of the image generation service.
use std::{io::Cursor, sync::Arc};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use dalle_core::{GenerationRequest, ModelLike};
use image::DynamicImage;
use serde::Serialize;
use thiserror::Error;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

/// Encodes an image as JPEG and returns it base64-encoded.
pub fn image_to_base64_jpeg(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Jpeg)?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("error generating images: {0:#}")]
    Generation(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Generation(e) => {
                error!("Error generating images: {:?}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    success: bool,
}

// Application state containing the preloaded model.
#[derive(Clone)]
pub struct AppState {
    pub model: Arc<dyn ModelLike>,
    /// Largest `num_images` a single request may ask for.
    pub max_images: Option<u32>,
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse { success: true })
}

/// Accepts any content type; the body is always parsed as JSON.
async fn generate_images_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Vec<String>>, ApiError> {
    let request: GenerationRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if let Some(max) = state.max_images {
        if request.num_images > max {
            return Err(ApiError::BadRequest(format!(
                "num_images must be at most {max}, got {}",
                request.num_images
            )));
        }
    }

    let text = request.text.clone();
    let num_images = request.num_images;
    let model = state.model.clone();
    let images = tokio::task::spawn_blocking(move || model.run(request))
        .await
        .map_err(anyhow::Error::from)??;

    let encoded = images
        .iter()
        .map(image_to_base64_jpeg)
        .collect::<Result<Vec<_>>>()?;

    info!("Created {} images from text prompt [{}]", num_images, text);
    Ok(Json(encoded))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/dalle", post(generate_images_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

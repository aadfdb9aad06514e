//! Image upload endpoint.
//!
//! POST /upload_image
//!
//! Second producer besides the broker bridge: persists an uploaded image and
//! broadcasts a `new_image` event to all stream clients. Same rule as the
//! bridge: the broadcast happens only after the row is committed.

use axum::{
    extract::{Extension, Json},
    http::StatusCode,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::kernel::events::StreamEvent;
use crate::kernel::images;
use crate::kernel::storage::NewImage;
use crate::server::app::AxumAppState;

#[derive(Deserialize)]
pub struct UploadImageRequest {
    pub tray_number: i32,
    pub image_data_base64: String,
    #[serde(default)]
    pub count: Option<i32>,
    #[serde(default)]
    pub avg_length: Option<f64>,
    #[serde(default)]
    pub avg_weight: Option<f64>,
    #[serde(default)]
    pub bounding_boxes: Option<serde_json::Value>,
    #[serde(default)]
    pub masks: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct UploadImageResponse {
    pub message: String,
    pub image_id: i32,
    pub size: i32,
    pub tray_number: i32,
}

pub async fn upload_image_handler(
    Extension(state): Extension<AxumAppState>,
    Json(body): Json<UploadImageRequest>,
) -> Result<Json<UploadImageResponse>, (StatusCode, Json<serde_json::Value>)> {
    let decoded = images::decode_image(&body.image_data_base64).map_err(|error| {
        tracing::warn!(%error, tray_number = body.tray_number, "rejected image upload");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid image format"})),
        )
    })?;

    let now = Utc::now();
    let image = NewImage {
        tray_number: body.tray_number,
        size: decoded.bytes.len() as i32,
        data: decoded.bytes,
        format: decoded.format,
        avg_length: body.avg_length,
        avg_weight: body.avg_weight,
        count: body.count,
        bounding_boxes: body.bounding_boxes.map(|v| v.to_string()),
        masks: body.masks.map(|v| v.to_string()),
        timestamp: now,
    };
    let size = image.size;

    let image_id = state.store.persist_image(&image).await.map_err(|error| {
        tracing::error!(%error, tray_number = body.tray_number, "image upload persistence failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Database error"})),
        )
    })?;

    let delivered = state.registry.broadcast(&StreamEvent::NewImage {
        tray_number: body.tray_number,
        timestamp: now,
        image_id,
        count: body.count,
        avg_length: body.avg_length,
        avg_weight: body.avg_weight,
    });
    tracing::info!(
        image_id,
        tray_number = body.tray_number,
        delivered,
        "image uploaded and broadcast"
    );

    Ok(Json(UploadImageResponse {
        message: "Image saved to database successfully".to_string(),
        image_id,
        size,
        tray_number: body.tray_number,
    }))
}

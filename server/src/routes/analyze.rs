//! Image analysis endpoint.
//!
//! `POST /analyze` takes a multipart form with a `file` part (image bytes) and
//! a `query` text part, runs the query through the loaded engine and returns
//! `{"response": "<text>"}`.

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tracing::{error, info};

use super::{api_error, ApiError};
use crate::engine::detect_mime;
use crate::AppState;

/// `POST /analyze` — run a vision query.
///
/// # Errors
///
/// - `400 Bad Request` with `{"code":"BAD_MULTIPART"}` — malformed form, or empty image
/// - `422 Unprocessable Entity` with `{"code":"MISSING_FIELD"}` — `file` or `query` absent
/// - `503 Service Unavailable` with `{"code":"MODEL_NOT_LOADED"}` — engine still loading
/// - `500 Internal Server Error` with `{"code":"PROCESSING_FAILED"}` — engine error text
pub async fn analyze(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut image: Option<Vec<u8>> = None;
    let mut query: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "BAD_MULTIPART", e.body_text()))?
    {
        match field.name() {
            Some("file") => {
                let bytes = field.bytes().await.map_err(|e| {
                    api_error(StatusCode::BAD_REQUEST, "BAD_MULTIPART", e.body_text())
                })?;
                image = Some(bytes.to_vec());
            }
            Some("query") => {
                let text = field.text().await.map_err(|e| {
                    api_error(StatusCode::BAD_REQUEST, "BAD_MULTIPART", e.body_text())
                })?;
                query = Some(text);
            }
            _ => {}
        }
    }

    let image = image.ok_or_else(|| {
        api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "MISSING_FIELD",
            "Missing 'file' field",
        )
    })?;
    let query = query.ok_or_else(|| {
        api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "MISSING_FIELD",
            "Missing 'query' field",
        )
    })?;
    if image.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "BAD_MULTIPART",
            "Empty image",
        ));
    }

    let Some(engine) = state.engine.read().await.clone() else {
        return Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "MODEL_NOT_LOADED",
            "Model not loaded",
        ));
    };

    let request_id = uuid::Uuid::new_v4();
    let preview: String = query.chars().take(50).collect();
    info!(%request_id, bytes = image.len(), "Processing query: {preview}");

    match engine.analyze(&image, detect_mime(&image), &query).await {
        Ok(response) => Ok(Json(json!({ "response": response }))),
        Err(e) => {
            error!(%request_id, "Analysis failed: {e}");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "PROCESSING_FAILED",
                e.to_string(),
            ))
        }
    }
}

//! Authenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /health` — readiness probe.
///
/// `status` is `"ready"` once the model engine is loaded and `"loading"`
/// before that. `security` is `"disabled"` when no access token is
/// configured (development mode).
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let engine = state.engine.read().await.clone();
    let model = engine.as_ref().map(|e| e.model_name().to_string());

    Json(json!({
        "status": if engine.is_some() { "ready" } else { "loading" },
        "model": model,
        "security": state.credentials.security_mode(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

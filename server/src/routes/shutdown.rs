//! Remote shutdown, used to release the GPU host when a session ends.

use axum::{extract::State, Json};
use serde_json::{json, Value};
use tracing::warn;

use crate::AppState;

/// `POST /shutdown` — acknowledge, then let `main` drain and exit.
///
/// Cancels the shared shutdown token; the server finishes in-flight requests
/// through axum's graceful shutdown and the process exits.
pub async fn shutdown(State(state): State<AppState>) -> Json<Value> {
    warn!("Shutdown requested");
    state.shutdown.cancel();
    Json(json!({"status": "shutting down"}))
}

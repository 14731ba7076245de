//! Unauthenticated service description.

use axum::Json;
use serde_json::{json, Value};

/// `GET /` — service name and endpoint list. No authentication required.
pub async fn root() -> Json<Value> {
    Json(json!({
        "service": "Sovereign-Doc Cloud Brain",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/analyze", "/shutdown"],
    }))
}

//! HTTP route handlers and router assembly.
//!
//! Each sub-module corresponds to one endpoint. All handlers except [`root`]
//! sit behind [`crate::auth::require_access_token`]; `/analyze` additionally
//! requires the legacy bearer when `auth.enforce_legacy_bearer` is set.

pub mod analyze;
pub mod health;
pub mod root;
pub mod shutdown;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::AppState;

/// Error half of every fallible handler: status plus `{"error", "code"}` body.
pub type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (status, Json(json!({"error": message.into(), "code": code})))
}

/// Build the full router for the inference service.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/", get(root::root));

    let mut analyze_route = Router::new().route(
        "/analyze",
        post(analyze::analyze).layer(ConcurrencyLimitLayer::new(
            state.config.server.max_concurrent_analyses.max(1),
        )),
    );
    if state.config.auth.enforce_legacy_bearer {
        analyze_route = analyze_route.layer(middleware::from_fn(auth::require_legacy_bearer));
    }

    let authed_routes = Router::new()
        .route("/health", get(health::health))
        .route("/shutdown", post(shutdown::shutdown))
        .merge(analyze_route)
        .layer(middleware::from_fn(auth::require_access_token));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(DefaultBodyLimit::max(state.config.server.max_upload_bytes))
        .layer(Extension(state.credentials.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

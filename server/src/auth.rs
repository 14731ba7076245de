//! Shared-secret authentication for the inference endpoints.
//!
//! Two independent guards, attached per route:
//!
//! - [`require_access_token`] — primary scheme, `X-Sovereign-Token: <token>`.
//!   When no token is configured the service runs in development mode: the
//!   guard logs a warning and lets the request through.
//! - [`require_legacy_bearer`] — legacy scheme, `Authorization: Bearer <secret>`,
//!   kept while clients migrate to the primary header.
//!
//! Both compare secrets in constant time. The expected secrets are injected
//! via the [`Credentials`] extension.

use std::sync::Arc;

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{debug, warn};

/// Header carrying the primary access token.
pub const ACCESS_TOKEN_HEADER: &str = "x-sovereign-token";

/// Extension type carrying the expected secrets, injected into the router
/// layer so the guards can access them without touching `AppState`.
#[derive(Clone)]
pub struct Credentials(pub Arc<CredentialSlots>);

/// The two credential slots. They coexist during the migration period.
pub struct CredentialSlots {
    pub legacy_secret: String,
    pub access_token: Option<String>,
}

impl Credentials {
    pub fn new(legacy_secret: String, access_token: Option<String>) -> Self {
        Self(Arc::new(CredentialSlots {
            legacy_secret,
            access_token,
        }))
    }

    /// `"enabled"` when a primary token is configured, `"disabled"` in
    /// development mode.
    pub fn security_mode(&self) -> &'static str {
        if self.0.access_token.is_some() {
            "enabled"
        } else {
            "disabled"
        }
    }
}

/// Axum middleware enforcing the primary `X-Sovereign-Token` header.
///
/// # Error responses
///
/// - `401 Unauthorized` — header missing, or token does not match
/// - `500 Internal Server Error` — [`Credentials`] extension not found (misconfiguration)
pub async fn require_access_token(request: Request, next: Next) -> Response {
    let Some(credentials) = request.extensions().get::<Credentials>().cloned() else {
        return misconfigured();
    };

    let Some(expected) = credentials.0.access_token.as_deref() else {
        warn!(
            path = %request.uri().path(),
            "No access token configured, accepting request (development mode)"
        );
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());

    let Some(provided) = provided else {
        warn!(path = %request.uri().path(), "Request missing access token header");
        return unauthorized("Missing X-Sovereign-Token header");
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        warn!(path = %request.uri().path(), "Invalid access token");
        return unauthorized("Invalid access token");
    }

    debug!(path = %request.uri().path(), "Access token verified");
    next.run(request).await
}

/// Axum middleware enforcing the legacy `Authorization: Bearer` header.
///
/// # Error responses
///
/// - `401 Unauthorized` — header missing, malformed, or secret does not match
/// - `500 Internal Server Error` — [`Credentials`] extension not found (misconfiguration)
pub async fn require_legacy_bearer(request: Request, next: Next) -> Response {
    let Some(credentials) = request.extensions().get::<Credentials>().cloned() else {
        return misconfigured();
    };

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match provided {
        Some(p) if constant_time_eq(credentials.0.legacy_secret.as_bytes(), p.as_bytes()) => {
            next.run(request).await
        }
        _ => {
            warn!(path = %request.uri().path(), "Legacy bearer check failed");
            unauthorized("Unauthorized")
        }
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": message, "code": "UNAUTHORIZED"})),
    )
        .into_response()
}

fn misconfigured() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "Server configuration error"})),
    )
        .into_response()
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the secret length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

//! Shared application state passed to every handler via Axum's `State` extractor.
//!
//! Everything a handler needs is constructed once in `main` and injected here;
//! there are no process-wide singletons for the model or the secrets.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::auth::Credentials;
use crate::config::Config;
use crate::engine::{self, EngineSlot};

/// Shared application state for the inference service.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// The model engine, empty until the backend has loaded.
    pub engine: EngineSlot,
    /// Expected secrets for the authentication guards.
    pub credentials: Credentials,
    /// Cancelled by `POST /shutdown`; drives graceful shutdown in `main`.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build state from configuration with an empty engine slot.
    pub fn new(config: Config) -> Self {
        let credentials = Credentials::new(
            config.auth.legacy_secret.clone(),
            config.auth.access_token.clone(),
        );
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            engine: engine::empty_slot(),
            credentials,
            shutdown: CancellationToken::new(),
        }
    }
}

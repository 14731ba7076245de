//! Inference dispatch: cache, tunnel check, remote with retries, local
//! fallback.
//!
//! [`InferenceDispatcher::process`] is the single entry point. Every
//! successful answer, remote or local, is cached; a failed fallback's
//! tagged string is not. Dropping the returned future cancels whatever
//! network call is in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKey, CacheStats, InferenceCache};
use crate::client::{ClientError, RemoteInference};
use crate::config::Config;
use crate::error::GatewayError;
use crate::fallback::{FallbackError, LocalModel, FALLBACK_ERROR_TAG};
use crate::security::AuthFailureMonitor;
use crate::tunnel::TunnelSupervisor;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Remote attempts per request, including the first.
    pub max_retries: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub fallback_timeout: Duration,
    pub fallback_permits: usize,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.dispatch.max_retries,
            backoff: Duration::from_millis(config.dispatch.backoff_ms),
            max_backoff: Duration::from_millis(config.dispatch.max_backoff_ms),
            fallback_timeout: Duration::from_secs(config.fallback.timeout_secs),
            fallback_permits: config.fallback.max_concurrent,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            fallback_timeout: Duration::from_secs(60),
            fallback_permits: 1,
        }
    }
}

pub struct InferenceDispatcher {
    supervisor: TunnelSupervisor,
    remote: Arc<dyn RemoteInference>,
    fallback: Option<Arc<dyn LocalModel>>,
    fallback_permits: Semaphore,
    cache: InferenceCache,
    security: Arc<AuthFailureMonitor>,
    settings: DispatchSettings,
}

impl InferenceDispatcher {
    pub fn new(
        supervisor: TunnelSupervisor,
        remote: Arc<dyn RemoteInference>,
        fallback: Option<Arc<dyn LocalModel>>,
        cache: InferenceCache,
        security: Arc<AuthFailureMonitor>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            supervisor,
            remote,
            fallback,
            fallback_permits: Semaphore::new(settings.fallback_permits.max(1)),
            cache,
            security,
            settings,
        }
    }

    /// Answer `query` about `image`. `timeout` bounds each remote attempt
    /// and the local fallback.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::TunnelUnavailable`] — tunnel not active; nothing is sent
    /// - [`GatewayError::Blocked`] — too many authentication failures
    /// - [`GatewayError::Remote`] — non-retryable rejection (4xx)
    /// - [`GatewayError::RetriesExhausted`] — retries exhausted and fallback disabled
    ///
    /// A failing fallback is not an error: the result is a string starting
    /// with [`FALLBACK_ERROR_TAG`].
    pub async fn process(
        &self,
        image: &[u8],
        query: &str,
        timeout: Duration,
    ) -> Result<String, GatewayError> {
        let key = CacheKey::derive(image, query);
        if let Some(hit) = self.cache.get(&key).await {
            debug!(%key, "Cache hit");
            return Ok(hit);
        }

        let status = self.supervisor.status().await;
        let Some(base_url) = status.public_url.filter(|_| status.active) else {
            warn!(state = ?status.state, "Remote brain tunnel not active");
            return Err(GatewayError::TunnelUnavailable);
        };
        if self.security.is_compromised() {
            warn!("Remote dispatch blocked by authentication failure monitor");
            return Err(GatewayError::Blocked);
        }

        let attempts = self.settings.max_retries.max(1);
        let mut backoff = self.settings.backoff;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            debug!(%key, attempt, attempts, "Sending request to {base_url}/analyze");
            let outcome = match tokio::time::timeout(
                timeout,
                self.remote.analyze(&base_url, image, query, &key),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout(timeout)),
            };

            match outcome {
                Ok(text) => {
                    let text = text.trim().to_string();
                    self.cache.put(key, text.clone()).await;
                    info!(%key, chars = text.len(), "Remote analysis successful");
                    return Ok(text);
                }
                Err(e) if e.is_auth_failure() => {
                    error!("Remote authentication failed: {e}");
                    self.security.record_failure(e.status().unwrap_or_default());
                    return Err(e.into());
                }
                Err(e) if !e.is_transient() => {
                    error!("Remote rejected request: {e}");
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(attempt, attempts, "Remote attempt failed: {e}");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.settings.max_backoff);
                    }
                }
            }
        }

        self.run_fallback(key, image, query, timeout, attempts, last_error)
            .await
    }

    async fn run_fallback(
        &self,
        key: CacheKey,
        image: &[u8],
        query: &str,
        timeout: Duration,
        attempts: u32,
        last_error: String,
    ) -> Result<String, GatewayError> {
        let Some(model) = &self.fallback else {
            return Err(GatewayError::RetriesExhausted {
                attempts,
                last: last_error,
            });
        };
        info!("Remote unavailable after {attempts} attempts, using local model {}", model.name());

        // Waiting for a permit counts against the same budget.
        let limit = timeout.min(self.settings.fallback_timeout);
        let bounded = tokio::time::timeout(limit, async {
            let _permit = self.fallback_permits.acquire().await.ok()?;
            Some(model.generate(image, query).await)
        })
        .await;

        let result = match bounded {
            Ok(Some(result)) => result,
            Ok(None) => {
                return Err(GatewayError::RetriesExhausted {
                    attempts,
                    last: last_error,
                })
            }
            Err(_) => Err(FallbackError::Timeout(limit)),
        };

        match result {
            Ok(text) => {
                let text = text.trim().to_string();
                self.cache.put(key, text.clone()).await;
                info!(%key, chars = text.len(), "Local analysis successful");
                Ok(text)
            }
            Err(e) => {
                error!("Local fallback failed: {e}");
                Ok(format!("{FALLBACK_ERROR_TAG}: {e}"))
            }
        }
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn clear_cache(&self) -> usize {
        self.cache.clear().await
    }

    pub fn security(&self) -> &AuthFailureMonitor {
        &self.security
    }
}

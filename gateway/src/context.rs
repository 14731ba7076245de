//! Wiring: builds every gateway component from one [`Config`].

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::InferenceCache;
use crate::client::BrainClient;
use crate::config::{Config, ConfigError, ProviderKind, DEFAULT_LEGACY_SECRET};
use crate::dispatcher::{DispatchSettings, InferenceDispatcher};
use crate::error::GatewayError;
use crate::fallback::{LocalModel, OllamaFallback};
use crate::security::AuthFailureMonitor;
use crate::tunnel::{
    FixedUrlProvider, NgrokAgent, ProviderError, SupervisorSettings, TunnelProvider, TunnelSupervisor,
};

pub struct GatewayContext {
    pub config: Config,
    pub supervisor: TunnelSupervisor,
    pub client: Arc<BrainClient>,
    pub dispatcher: InferenceDispatcher,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayContext {
    pub fn build(config: Config) -> Result<Self, GatewayError> {
        let provider: Arc<dyn TunnelProvider> = match config.tunnel.provider {
            ProviderKind::Ngrok => {
                if config.tunnel.authtoken.is_none() {
                    warn!("No ngrok authtoken in config or NGROK_TOKEN / NGROK_AUTH_TOKEN / SOVEREIGN_NGROK_TOKEN");
                }
                Arc::new(NgrokAgent::new(&config.tunnel.ngrok)?)
            }
            ProviderKind::Fixed => {
                let url = config.tunnel.url.as_deref().ok_or_else(|| {
                    GatewayError::Config(ConfigError::Invalid(
                        "tunnel.url is required for the fixed provider".into(),
                    ))
                })?;
                Arc::new(FixedUrlProvider::new(url)?)
            }
        };
        Self::with_provider(config, provider)
    }

    /// Build around an explicit provider.
    pub fn with_provider(config: Config, provider: Arc<dyn TunnelProvider>) -> Result<Self, GatewayError> {
        if config.remote.legacy_secret.expose() == DEFAULT_LEGACY_SECRET {
            warn!("Using the default legacy secret, set SOVEREIGN_BRAIN_SECRET");
        }
        if config.remote.access_token.is_none() {
            warn!("No SOVEREIGN_ACCESS_TOKEN configured, remote must run in development mode");
        }

        let supervisor = TunnelSupervisor::new(provider, SupervisorSettings::from_config(&config));
        let client = Arc::new(BrainClient::new(&config.remote, &config.security).map_err(GatewayError::Client)?);
        let fallback: Option<Arc<dyn LocalModel>> = if config.fallback.enabled {
            let model = OllamaFallback::new(&config.fallback).map_err(|e| {
                GatewayError::Config(ConfigError::Invalid(format!(
                    "local fallback client: {e}"
                )))
            })?;
            Some(Arc::new(model))
        } else {
            None
        };

        let dispatcher = InferenceDispatcher::new(
            supervisor.clone(),
            client.clone(),
            fallback,
            InferenceCache::from_config(&config.cache),
            Arc::new(AuthFailureMonitor::from_config(&config.security)),
            DispatchSettings::from_config(&config),
        );

        Ok(Self {
            config,
            supervisor,
            client,
            dispatcher,
            monitor: Mutex::new(None),
        })
    }

    /// Open the tunnel and start background health monitoring.
    pub async fn init(&self) -> Result<String, ProviderError> {
        let url = self.supervisor.start(self.config.tunnel.port).await?;
        let handle = self
            .supervisor
            .spawn_health_monitor(self.config.tunnel.health_interval());
        if let Some(old) = self.monitor.lock().await.replace(handle) {
            old.abort();
        }
        info!(
            "Gateway ready: {} tunnel at {url}, health check every {}s",
            self.supervisor.provider_name(),
            self.config.tunnel.health_interval_secs
        );
        Ok(url)
    }

    /// Stop monitoring and tear the tunnel down.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.monitor.lock().await.take() {
            handle.abort();
        }
        self.supervisor.shutdown().await;
    }

    /// Run `work` unless `interrupt` resolves first, then shut down either
    /// way. Returns `None` when interrupted.
    pub async fn run_guarded<T>(
        &self,
        work: impl Future<Output = T>,
        interrupt: impl Future<Output = ()>,
    ) -> Option<T> {
        let outcome = tokio::select! {
            out = work => Some(out),
            () = interrupt => {
                info!("Interrupted, closing tunnel");
                None
            }
        };
        self.shutdown().await;
        outcome
    }
}

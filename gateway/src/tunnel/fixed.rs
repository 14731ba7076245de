//! Provider for a tunnel someone else already opened (a notebook-hosted
//! ngrok session, a reverse proxy). `connect` hands back the configured URL;
//! `list_active` reports it only while it answers HTTP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::provider::{ProviderError, TunnelProvider};

pub struct FixedUrlProvider {
    url: String,
    http: reqwest::Client,
    connected: AtomicBool,
}

impl FixedUrlProvider {
    pub fn new(url: &str) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            http,
            connected: AtomicBool::new(false),
        })
    }

    /// Any HTTP answer counts: `/` is the remote's unauthenticated endpoint.
    async fn reachable(&self) -> bool {
        match self.http.get(format!("{}/", self.url)).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!("Fixed tunnel URL unreachable: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl TunnelProvider for FixedUrlProvider {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn authenticate(&self, _token: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn connect(&self, _port: u16, require_encryption: bool) -> Result<String, ProviderError> {
        if require_encryption && !self.url.starts_with("https://") {
            return Err(ProviderError::InsecureUrl(self.url.clone()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(self.url.clone())
    }

    async fn disconnect(&self, url: &str) -> Result<(), ProviderError> {
        if url == self.url {
            self.connected.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<String>, ProviderError> {
        if self.connected.load(Ordering::SeqCst) && self.reachable().await {
            Ok(vec![self.url.clone()])
        } else {
            Ok(Vec::new())
        }
    }

    async fn terminate_all(&self) -> Result<(), ProviderError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

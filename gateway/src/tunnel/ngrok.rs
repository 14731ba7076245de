//! ngrok agent provider.
//!
//! Talks to the agent's local REST API (`/api/tunnels`). With
//! `manage_process` the provider spawns `ngrok start --none` itself, hands it
//! the authtoken through `NGROK_AUTHTOKEN` (never on the command line, never
//! logged) and owns the child: it is killed on teardown and on drop.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::provider::{ProviderError, TunnelProvider};
use crate::config::NgrokConfig;

const API_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct NgrokAgent {
    http: reqwest::Client,
    api_url: String,
    binary: String,
    manage_process: bool,
    startup_timeout: Duration,
    authtoken: Mutex<Option<String>>,
    child: Mutex<Option<Child>>,
    /// public URL -> agent tunnel name
    tunnels: Mutex<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct ApiTunnel {
    name: String,
    public_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiTunnelList {
    #[serde(default)]
    tunnels: Vec<ApiTunnel>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NgrokAgent {
    pub fn new(config: &NgrokConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            binary: config.binary.clone(),
            manage_process: config.manage_process,
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
            authtoken: Mutex::new(None),
            child: Mutex::new(None),
            tunnels: Mutex::new(HashMap::new()),
        })
    }

    fn tunnels_url(&self) -> String {
        format!("{}/api/tunnels", self.api_url)
    }

    /// Spawn the agent if we own it and it is not running, then wait for its API.
    async fn ensure_agent(&self) -> Result<(), ProviderError> {
        if !self.manage_process {
            return Ok(());
        }
        let spawned = {
            let mut child = lock(&self.child);
            let running = child
                .as_mut()
                .is_some_and(|c| matches!(c.try_wait(), Ok(None)));
            if running {
                false
            } else {
                let mut cmd = Command::new(&self.binary);
                cmd.args(["start", "--none", "--log", "stdout"])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true);
                if let Some(token) = lock(&self.authtoken).as_deref() {
                    cmd.env("NGROK_AUTHTOKEN", token);
                }
                *child = Some(cmd.spawn().map_err(ProviderError::Spawn)?);
                true
            }
        };
        if spawned {
            info!("Started ngrok agent ({})", self.binary);
            self.wait_for_api().await?;
        }
        Ok(())
    }

    async fn wait_for_api(&self) -> Result<(), ProviderError> {
        let deadline = tokio::time::Instant::now() + self.startup_timeout;
        loop {
            match self.http.get(self.tunnels_url()).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => debug!("ngrok API not ready: HTTP {}", resp.status()),
                Err(e) => debug!("ngrok API not ready: {e}"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProviderError::StartupTimeout(self.startup_timeout));
            }
            tokio::time::sleep(API_POLL_INTERVAL).await;
        }
    }

    async fn fetch_tunnels(&self) -> Result<Vec<ApiTunnel>, ProviderError> {
        let resp = self.http.get(self.tunnels_url()).send().await?;
        let list: ApiTunnelList = Self::handle_response(resp).await?;
        Ok(list.tunnels)
    }

    async fn delete_tunnel(&self, name: &str) -> Result<(), ProviderError> {
        let resp = self
            .http
            .delete(format!("{}/{name}", self.tunnels_url()))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            debug!("Deleted ngrok tunnel {name}");
            return Ok(());
        }
        Err(Self::api_error(resp).await)
    }

    async fn handle_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ProviderError> {
        if resp.status().is_success() {
            Ok(resp.json().await?)
        } else {
            Err(Self::api_error(resp).await)
        }
    }

    /// The agent reports failures as `{"msg": ..., "details": {...}}`.
    async fn api_error(resp: reqwest::Response) -> ProviderError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v["msg"].as_str().map(String::from))
            .unwrap_or(body);
        ProviderError::Api { status, message }
    }
}

#[async_trait]
impl TunnelProvider for NgrokAgent {
    fn name(&self) -> &str {
        "ngrok"
    }

    async fn authenticate(&self, token: &str) -> Result<(), ProviderError> {
        if token.is_empty() {
            return Err(ProviderError::Auth("empty authtoken".into()));
        }
        if !self.manage_process {
            debug!("ngrok agent is externally managed; using its configured credentials");
        }
        *lock(&self.authtoken) = Some(token.to_string());
        Ok(())
    }

    async fn connect(&self, port: u16, require_encryption: bool) -> Result<String, ProviderError> {
        if !require_encryption {
            return Err(ProviderError::EncryptionRequired);
        }
        self.ensure_agent().await?;

        let resp = self
            .http
            .post(self.tunnels_url())
            .json(&json!({
                "addr": port.to_string(),
                "proto": "http",
                "name": format!("docbrain-{port}"),
                "schemes": ["https"],
            }))
            .send()
            .await?;
        let tunnel: ApiTunnel = Self::handle_response(resp).await?;

        if !tunnel.public_url.starts_with("https://") {
            if let Err(e) = self.delete_tunnel(&tunnel.name).await {
                warn!("Failed to remove insecure tunnel {}: {e}", tunnel.name);
            }
            return Err(ProviderError::InsecureUrl(tunnel.public_url));
        }

        lock(&self.tunnels).insert(tunnel.public_url.clone(), tunnel.name);
        Ok(tunnel.public_url)
    }

    async fn disconnect(&self, url: &str) -> Result<(), ProviderError> {
        let known = lock(&self.tunnels).remove(url);
        let name = match known {
            Some(name) => name,
            None => match self
                .fetch_tunnels()
                .await?
                .into_iter()
                .find(|t| t.public_url == url)
            {
                Some(t) => t.name,
                None => return Ok(()),
            },
        };
        self.delete_tunnel(&name).await
    }

    async fn list_active(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self
            .fetch_tunnels()
            .await?
            .into_iter()
            .map(|t| t.public_url)
            .collect())
    }

    async fn terminate_all(&self) -> Result<(), ProviderError> {
        let names: Vec<String> = lock(&self.tunnels).drain().map(|(_, name)| name).collect();
        let child = lock(&self.child).take();
        match child {
            Some(mut child) => {
                // Killing the agent takes its tunnels with it.
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill ngrok agent: {e}");
                } else {
                    info!("ngrok agent stopped");
                }
            }
            None => {
                for name in names {
                    if let Err(e) = self.delete_tunnel(&name).await {
                        warn!("Failed to delete ngrok tunnel {name}: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    fn terminate_now(&self) {
        if let Some(child) = lock(&self.child).as_mut() {
            if let Err(e) = child.start_kill() {
                debug!("ngrok agent already gone: {e}");
            }
        }
    }
}

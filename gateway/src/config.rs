//! Gateway configuration.
//!
//! Resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `SOVEREIGN_ACCESS_TOKEN`,
//!    `SOVEREIGN_BRAIN_SECRET`, `SOVEREIGN_SIGNING_SECRET`,
//!    `DOCBRAIN_TUNNEL_URL` (switches the provider to `fixed`)
//! 2. **Config file** — path via `--config <path>`, or `gateway.toml` in CWD
//! 3. **Compiled defaults**
//!
//! The tunnel authtoken is the exception: a token in the file wins, and the
//! environment is only consulted when the file has none (`NGROK_TOKEN`,
//! then `NGROK_AUTH_TOKEN`, then `SOVEREIGN_NGROK_TOKEN`).
//!
//! ```toml
//! [tunnel]
//! provider = "ngrok"             # or "fixed" with `url`
//! port = 8000
//! health_interval_secs = 30
//! restart_delay_ms = 2000
//! max_reconnect_attempts = 3
//!
//! [tunnel.ngrok]
//! binary = "ngrok"
//! api_url = "http://127.0.0.1:4040"
//! manage_process = true
//!
//! [remote]
//! access_token = "..."
//!
//! [dispatch]
//! max_retries = 3
//! timeout_ms = 30000
//! backoff_ms = 1000
//! max_backoff_ms = 5000
//!
//! [cache]
//! max_entries = 1024
//! ttl_secs = 86400
//!
//! [fallback]
//! base_url = "http://localhost:11434"
//! model = "llama3.2-vision"
//!
//! [security]
//! max_auth_failures = 3
//! failure_window_secs = 60
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Legacy bearer secret the remote service ships with.
pub const DEFAULT_LEGACY_SECRET: &str = "sovereign-secret-key";

/// Environment variables consulted for the tunnel authtoken, in order.
pub const AUTHTOKEN_ENV_VARS: [&str; 3] = ["NGROK_TOKEN", "NGROK_AUTH_TOKEN", "SOVEREIGN_NGROK_TOKEN"];

/// A secret string that never shows up in `Debug` output or logs.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which tunnel provider backs the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// The ngrok agent, driven over its local REST API.
    #[default]
    Ngrok,
    /// A pre-established public URL.
    Fixed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    /// Local port of the remote service to expose (default 8000).
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub authtoken: Option<Secret>,
    /// Public URL for the `fixed` provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    /// Pause between teardown and re-establishment on restart (default 2 s).
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default)]
    pub ngrok: NgrokConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NgrokConfig {
    #[serde(default = "default_ngrok_binary")]
    pub binary: String,
    /// Local agent API (default `http://127.0.0.1:4040`).
    #[serde(default = "default_ngrok_api")]
    pub api_url: String,
    /// Spawn and own the agent process instead of using a running one.
    #[serde(default = "default_true")]
    pub manage_process: bool,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

/// Credentials presented to the remote service.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_legacy_secret")]
    pub legacy_secret: Secret,
    /// Sent as `X-Sovereign-Token` when set.
    #[serde(default)]
    pub access_token: Option<Secret>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Remote attempts before falling back (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-attempt timeout (default 30 s).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Entry lifetime; 0 keeps entries until evicted or cleared.
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_fallback_url")]
    pub base_url: String,
    #[serde(default = "default_fallback_model")]
    pub model: String,
    #[serde(default = "default_fallback_timeout")]
    pub timeout_secs: u64,
    /// Concurrent local invocations allowed (default 1).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_max_auth_failures")]
    pub max_auth_failures: usize,
    #[serde(default = "default_failure_window")]
    pub failure_window_secs: u64,
    /// HMAC key for `X-Sovereign-Signature`. Unset means presence-only checks.
    #[serde(default)]
    pub signing_secret: Option<Secret>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_port() -> u16 {
    8000
}
fn default_health_interval() -> u64 {
    30
}
fn default_restart_delay() -> u64 {
    2000
}
fn default_reconnect_attempts() -> u32 {
    3
}
fn default_ngrok_binary() -> String {
    "ngrok".to_string()
}
fn default_ngrok_api() -> String {
    "http://127.0.0.1:4040".to_string()
}
fn default_true() -> bool {
    true
}
fn default_startup_timeout() -> u64 {
    15
}
fn default_legacy_secret() -> Secret {
    Secret::new(DEFAULT_LEGACY_SECRET)
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    5000
}
fn default_max_entries() -> usize {
    1024
}
fn default_ttl() -> u64 {
    24 * 60 * 60
}
fn default_fallback_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_fallback_model() -> String {
    "llama3.2-vision".to_string()
}
fn default_fallback_timeout() -> u64 {
    60
}
fn default_max_concurrent() -> usize {
    1
}
fn default_max_auth_failures() -> usize {
    3
}
fn default_failure_window() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            port: default_port(),
            authtoken: None,
            url: None,
            health_interval_secs: default_health_interval(),
            restart_delay_ms: default_restart_delay(),
            max_reconnect_attempts: default_reconnect_attempts(),
            ngrok: NgrokConfig::default(),
        }
    }
}

impl Default for NgrokConfig {
    fn default() -> Self {
        Self {
            binary: default_ngrok_binary(),
            api_url: default_ngrok_api(),
            manage_process: true,
            startup_timeout_secs: default_startup_timeout(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            legacy_secret: default_legacy_secret(),
            access_token: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_ms: default_timeout_ms(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
            ttl_secs: default_ttl(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_fallback_url(),
            model: default_fallback_model(),
            timeout_secs: default_fallback_timeout(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_auth_failures: default_max_auth_failures(),
            failure_window_secs: default_failure_window(),
            signing_secret: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TunnelConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }
}

impl DispatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration: env vars > file > defaults, then validate.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("gateway.toml").exists() => Self::from_file("gateway.toml")?,
            None => Config::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply environment overrides through `lookup`. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if self.tunnel.authtoken.is_none() {
            self.tunnel.authtoken = AUTHTOKEN_ENV_VARS
                .iter()
                .find_map(|name| lookup(*name))
                .map(Secret::new);
        }
        if let Some(url) = lookup("DOCBRAIN_TUNNEL_URL") {
            self.tunnel.url = Some(url);
            self.tunnel.provider = ProviderKind::Fixed;
        }
        if let Some(token) = lookup("SOVEREIGN_ACCESS_TOKEN") {
            self.remote.access_token = Some(Secret::new(token));
        }
        if let Some(secret) = lookup("SOVEREIGN_BRAIN_SECRET") {
            self.remote.legacy_secret = Secret::new(secret);
        }
        if let Some(secret) = lookup("SOVEREIGN_SIGNING_SECRET") {
            self.security.signing_secret = Some(Secret::new(secret));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tunnel.provider == ProviderKind::Fixed && self.tunnel.url.is_none() {
            return Err(ConfigError::Invalid(
                "tunnel.provider = \"fixed\" requires tunnel.url".into(),
            ));
        }
        if self.dispatch.max_retries == 0 {
            return Err(ConfigError::Invalid("dispatch.max_retries must be at least 1".into()));
        }
        if self.dispatch.timeout_ms == 0 {
            return Err(ConfigError::Invalid("dispatch.timeout_ms must be positive".into()));
        }
        if self.fallback.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "fallback.max_concurrent must be at least 1".into(),
            ));
        }
        if self.security.max_auth_failures == 0 {
            return Err(ConfigError::Invalid(
                "security.max_auth_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `SOVEREIGN_ACCESS_TOKEN`,
//!    `SOVEREIGN_BRAIN_SECRET`, `DOCBRAIN_LISTEN`, `DOCBRAIN_MODEL_ENDPOINT`
//! 2. **Config file** — path via `--config <path>`, or `docbrain.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8000"
//! max_upload_bytes = 20971520  # 20 MB
//! max_concurrent_analyses = 1
//!
//! [auth]
//! legacy_secret = "your-legacy-secret"
//! access_token = "your-access-token"      # omit for development mode
//! enforce_legacy_bearer = false
//!
//! [model]
//! endpoint = "http://127.0.0.1:8001"      # OpenAI-compatible server (vLLM)
//! name = "Qwen/Qwen2.5-VL-7B-Instruct-AWQ"
//! temperature = 0.7
//! max_tokens = 512
//! top_p = 0.9
//! request_timeout_secs = 120
//! probe_interval_secs = 5
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Legacy bearer secret shipped as a default. Any real deployment must
/// override it; startup logs a warning while it is in use.
pub const DEFAULT_LEGACY_SECRET: &str = "sovereign-secret-key";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8000`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum request body for `/analyze` uploads (default 20 MB).
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// In-flight `/analyze` requests; extra requests wait (default 1, one GPU).
    #[serde(default = "default_max_concurrent_analyses")]
    pub max_concurrent_analyses: usize,
}

/// Shared-secret settings for the two authentication schemes.
#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    /// Legacy `Authorization: Bearer` secret. Override with `SOVEREIGN_BRAIN_SECRET`.
    #[serde(default = "default_legacy_secret")]
    pub legacy_secret: String,
    /// Primary `X-Sovereign-Token` secret. Override with `SOVEREIGN_ACCESS_TOKEN`.
    /// `None` runs the service in development mode (no token check).
    #[serde(default)]
    pub access_token: Option<String>,
    /// Also require the legacy bearer on `/analyze` (default false).
    #[serde(default)]
    pub enforce_legacy_bearer: bool,
}

/// Vision-language model backend settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Base URL of an OpenAI-compatible inference server. `None` leaves the
    /// engine unloaded and `/analyze` answers 503.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Model identifier passed to the backend.
    #[serde(default = "default_model_name")]
    pub name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Per-request timeout against the backend (default 120 s).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Seconds between readiness probes while the backend loads (default 5).
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Failure to produce a usable [`Config`].
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
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024 // 20 MB
}
fn default_max_concurrent_analyses() -> usize {
    1
}
fn default_legacy_secret() -> String {
    DEFAULT_LEGACY_SECRET.to_string()
}
fn default_model_name() -> String {
    "Qwen/Qwen2.5-VL-7B-Instruct-AWQ".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    512
}
fn default_top_p() -> f32 {
    0.9
}
fn default_request_timeout() -> u64 {
    120
}
fn default_probe_interval() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_upload_bytes: default_max_upload_bytes(),
            max_concurrent_analyses: default_max_concurrent_analyses(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            legacy_secret: default_legacy_secret(),
            access_token: None,
            enforce_legacy_bearer: false,
        }
    }
}

// Secrets stay out of debug output.
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("legacy_secret", &"****")
            .field("access_token", &self.access_token.as_ref().map(|_| "****"))
            .field("enforce_legacy_bearer", &self.enforce_legacy_bearer)
            .finish()
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            name: default_model_name(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            request_timeout_secs: default_request_timeout(),
            probe_interval_secs: default_probe_interval(),
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

impl AuthConfig {
    /// True while the shipped legacy secret is still in use.
    pub fn uses_default_legacy_secret(&self) -> bool {
        self.legacy_secret == DEFAULT_LEGACY_SECRET
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `docbrain.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("docbrain.toml").exists() => Self::from_file("docbrain.toml")?,
            None => Config::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
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

    /// Apply environment overrides through `lookup` (injectable for tests).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup("SOVEREIGN_ACCESS_TOKEN").filter(|t| !t.is_empty()) {
            self.auth.access_token = Some(token);
        }
        if let Some(secret) = lookup("SOVEREIGN_BRAIN_SECRET").filter(|s| !s.is_empty()) {
            self.auth.legacy_secret = secret;
        }
        if let Some(listen) = lookup("DOCBRAIN_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(endpoint) = lookup("DOCBRAIN_MODEL_ENDPOINT") {
            self.model.endpoint = Some(endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:8000");
        assert!(config.auth.access_token.is_none());
        assert!(config.auth.uses_default_legacy_secret());
        assert!(config.model.endpoint.is_none());
        assert_eq!(config.model.max_tokens, 512);
        assert_eq!(config.server.max_concurrent_analyses, 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[auth]\naccess_token = \"secret-xyz\"\n\n[model]\nendpoint = \"http://gpu:8001\""
        )
        .unwrap();
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.auth.access_token.as_deref(), Some("secret-xyz"));
        assert_eq!(config.model.endpoint.as_deref(), Some("http://gpu:8001"));
        assert_eq!(config.server.listen, "0.0.0.0:8000");
    }

    #[test]
    fn test_parse_error_names_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nlisten = ").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&path));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(|name| match name {
            "SOVEREIGN_ACCESS_TOKEN" => Some("from-env".to_string()),
            "SOVEREIGN_BRAIN_SECRET" => Some("legacy-env".to_string()),
            "DOCBRAIN_LISTEN" => Some("127.0.0.1:9000".to_string()),
            _ => None,
        });
        assert_eq!(config.auth.access_token.as_deref(), Some("from-env"));
        assert_eq!(config.auth.legacy_secret, "legacy-env");
        assert!(!config.auth.uses_default_legacy_secret());
        assert_eq!(config.server.listen, "127.0.0.1:9000");
    }

    #[test]
    fn test_empty_env_token_keeps_dev_mode() {
        let mut config = Config::default();
        config.apply_env(|name| (name == "SOVEREIGN_ACCESS_TOKEN").then(String::new));
        assert!(config.auth.access_token.is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = Config::default();
        config.auth.access_token = Some("secret-xyz".to_string());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret-xyz"));
        assert!(!rendered.contains(DEFAULT_LEGACY_SECRET));
    }
}

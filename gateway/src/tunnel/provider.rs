//! The seam between the supervisor and whatever actually opens the tunnel.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("tunnel provider authentication failed: {0}")]
    Auth(String),
    #[error("plaintext tunnels are not allowed")]
    EncryptionRequired,
    #[error("tunnel provider returned a non-HTTPS public URL: {0}")]
    InsecureUrl(String),
    #[error("tunnel agent API request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("tunnel agent API returned HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("failed to launch tunnel agent: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("tunnel agent did not become ready within {0:?}")]
    StartupTimeout(Duration),
    #[error("supervisor has shut down")]
    ShutDown,
}

/// A tunnel provider: exposes a local port at a public URL.
///
/// Implementations must be safe to call concurrently, but the supervisor
/// serializes lifecycle calls (`connect`, `disconnect`, `terminate_all`).
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Short provider name for logs (e.g. `"ngrok"`).
    fn name(&self) -> &str;

    /// Register the account credential. Called before every `connect`.
    async fn authenticate(&self, token: &str) -> Result<(), ProviderError>;

    /// Expose `port` and return the public URL. `require_encryption`
    /// forbids plaintext endpoints.
    async fn connect(&self, port: u16, require_encryption: bool) -> Result<String, ProviderError>;

    async fn disconnect(&self, url: &str) -> Result<(), ProviderError>;

    /// Public URLs of all tunnels the provider currently reports as live.
    async fn list_active(&self) -> Result<Vec<String>, ProviderError>;

    /// Tear down every tunnel and any agent process owned by the provider.
    async fn terminate_all(&self) -> Result<(), ProviderError>;

    /// Best-effort synchronous teardown for paths that cannot await
    /// (drop during unwinding). Default: nothing to do.
    fn terminate_now(&self) {}
}

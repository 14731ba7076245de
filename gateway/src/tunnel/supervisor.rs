//! Tunnel lifecycle supervision.
//!
//! [`TunnelSupervisor`] owns the single [`TunnelSession`] and drives it
//! through a [`TunnelProvider`]:
//!
//! ```text
//! Inactive ──start──▶ Starting ──▶ Active ──health miss──▶ Degraded
//!                        │                                    │
//!                        ▼                                    ▼
//!                      Failed ◀──all attempts fail── Reconnecting ──▶ Active
//!
//! any state ──stop──▶ Stopped
//! ```
//!
//! Lifecycle operations (`start`, `stop`, `restart`) are serialized by one
//! async lock; readers take a [`TunnelStatus`] snapshot and never observe a
//! URL on a session that is not `Active`. Backoff between reconnect
//! attempts reuses the fixed restart delay.
//!
//! Teardown is guaranteed: [`TunnelSupervisor::shutdown`] runs the exit hook
//! once, and if the last handle is dropped without it (early return, panic
//! unwinding) the provider's synchronous `terminate_now` is invoked.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::provider::{ProviderError, TunnelProvider};
use crate::config::{Config, Secret};
use crate::signature::{self, DIGEST_HEADER, SIGNATURE_HEADER};

/// Lifecycle state of the tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Inactive,
    Starting,
    Active,
    Degraded,
    Reconnecting,
    Failed,
    Stopped,
}

/// The one tunnel session a supervisor owns. `public_url` is set exactly
/// while `state` is `Active`; a degraded session parks the URL it lost in
/// `stale_url` until teardown disconnects it.
#[derive(Debug)]
struct TunnelSession {
    local_port: u16,
    public_url: Option<String>,
    stale_url: Option<String>,
    state: TunnelState,
    established_at: Option<Instant>,
    last_health_check: Option<Instant>,
}

/// Immutable snapshot handed to readers.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub active: bool,
    pub public_url: Option<String>,
    pub port: u16,
    pub state: TunnelState,
    pub established_secs_ago: Option<u64>,
    pub last_health_check_secs_ago: Option<u64>,
    pub restarts: u64,
}

/// Tunables for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub restart_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub authtoken: Option<Secret>,
    pub signing_secret: Option<Secret>,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            restart_delay: config.tunnel.restart_delay(),
            max_reconnect_attempts: config.tunnel.max_reconnect_attempts,
            authtoken: config.tunnel.authtoken.clone(),
            signing_secret: config.security.signing_secret.clone(),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(2),
            max_reconnect_attempts: 3,
            authtoken: None,
            signing_secret: None,
        }
    }
}

struct Inner {
    provider: Arc<dyn TunnelProvider>,
    settings: SupervisorSettings,
    session: Mutex<TunnelSession>,
    lifecycle: Mutex<()>,
    restart_in_flight: AtomicBool,
    exited: AtomicBool,
    restarts: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.exited.load(Ordering::SeqCst) {
            warn!("Tunnel supervisor dropped without shutdown, terminating provider");
            self.provider.terminate_now();
        }
    }
}

/// Clears the single-flight flag even if the restart future is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Cheaply cloneable handle; all clones share one session.
#[derive(Clone)]
pub struct TunnelSupervisor {
    inner: Arc<Inner>,
}

impl TunnelSupervisor {
    pub fn new(provider: Arc<dyn TunnelProvider>, settings: SupervisorSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                settings,
                session: Mutex::new(TunnelSession {
                    local_port: 0,
                    public_url: None,
                    stale_url: None,
                    state: TunnelState::Inactive,
                    established_at: None,
                    last_health_check: None,
                }),
                lifecycle: Mutex::new(()),
                restart_in_flight: AtomicBool::new(false),
                exited: AtomicBool::new(false),
                restarts: AtomicU64::new(0),
            }),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.inner.provider.name()
    }

    /// Open the tunnel for `port` and return its public URL. Encryption is
    /// always required. A provider failure leaves the session `Failed`.
    pub async fn start(&self, port: u16) -> Result<String, ProviderError> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.inner.exited.load(Ordering::SeqCst) {
            return Err(ProviderError::ShutDown);
        }
        {
            let session = self.inner.session.lock().await;
            if session.state == TunnelState::Active && session.local_port == port {
                if let Some(url) = &session.public_url {
                    debug!("Tunnel already active at {url}");
                    return Ok(url.clone());
                }
            }
        }
        self.start_locked(port).await
    }

    async fn start_locked(&self, port: u16) -> Result<String, ProviderError> {
        {
            let mut session = self.inner.session.lock().await;
            session.local_port = port;
            session.public_url = None;
            session.established_at = None;
            session.state = TunnelState::Starting;
        }

        let provider = &self.inner.provider;
        let result = async {
            if let Some(token) = &self.inner.settings.authtoken {
                provider.authenticate(token.expose()).await?;
            }
            provider.connect(port, true).await
        }
        .await;

        let mut session = self.inner.session.lock().await;
        match result {
            Ok(url) => {
                session.public_url = Some(url.clone());
                session.state = TunnelState::Active;
                session.established_at = Some(Instant::now());
                info!("Tunnel established via {}: {url} -> port {port}", provider.name());
                Ok(url)
            }
            Err(e) => {
                session.state = TunnelState::Failed;
                error!("Failed to establish tunnel via {}: {e}", provider.name());
                Err(e)
            }
        }
    }

    /// Close the tunnel. Idempotent; provider errors are logged.
    pub async fn stop(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.stop_locked(TunnelState::Stopped).await;
    }

    /// Mark the session `next` and drop the URL first, so no reader sees a
    /// half-torn-down tunnel as active, then tear down at the provider.
    async fn stop_locked(&self, next: TunnelState) {
        let url = {
            let mut session = self.inner.session.lock().await;
            session.state = next;
            session.established_at = None;
            let stale = session.stale_url.take();
            session.public_url.take().or(stale)
        };
        let provider = &self.inner.provider;
        if let Some(url) = url {
            if let Err(e) = provider.disconnect(&url).await {
                warn!("Error disconnecting tunnel {url}: {e}");
            }
            info!("Tunnel {url} closed");
        }
        if let Err(e) = provider.terminate_all().await {
            warn!("Error terminating {} tunnels: {e}", provider.name());
        }
    }

    /// Tear down and re-establish on the same port. Up to
    /// `max_reconnect_attempts` starts, each after `restart_delay`; the
    /// session ends `Failed` if all of them fail.
    pub async fn restart(&self) -> Result<String, ProviderError> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.inner.exited.load(Ordering::SeqCst) {
            return Err(ProviderError::ShutDown);
        }
        let port = self.inner.session.lock().await.local_port;
        info!("Restarting tunnel on port {port}");
        self.stop_locked(TunnelState::Reconnecting).await;
        self.inner.restarts.fetch_add(1, Ordering::SeqCst);

        let attempts = self.inner.settings.max_reconnect_attempts.max(1);
        let mut attempt = 1;
        loop {
            tokio::time::sleep(self.inner.settings.restart_delay).await;
            match self.start_locked(port).await {
                Ok(url) => return Ok(url),
                Err(e) if attempt < attempts => {
                    warn!("Reconnect attempt {attempt}/{attempts} failed: {e}");
                    self.inner.session.lock().await.state = TunnelState::Reconnecting;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Tunnel reconnect failed after {attempts} attempts");
                    return Err(e);
                }
            }
        }
    }

    /// Check the provider still reports our URL. On a miss the session goes
    /// `Degraded` and one restart is launched; a check that overlaps a
    /// running restart returns `false` without starting another. A failure
    /// to list tunnels is reported as unhealthy but leaves the tunnel alone.
    pub async fn monitor_health(&self) -> bool {
        let (state, url) = {
            let session = self.inner.session.lock().await;
            (session.state, session.public_url.clone())
        };
        let (TunnelState::Active, Some(url)) = (state, url) else {
            debug!("Skipping health check in state {state:?}");
            return false;
        };

        let listed = self.inner.provider.list_active().await;

        {
            let mut session = self.inner.session.lock().await;
            session.last_health_check = Some(Instant::now());
            let present = match listed {
                Ok(urls) => urls.iter().any(|u| u == &url),
                Err(e) => {
                    warn!("Failed to list active tunnels, keeping {url}: {e}");
                    return false;
                }
            };
            if session.public_url.as_deref() != Some(url.as_str()) {
                // A concurrent stop or restart replaced the session.
                return false;
            }
            if present {
                return true;
            }
            let lost = session.public_url.take();
            session.state = TunnelState::Degraded;
            session.stale_url = lost;
        }

        if self
            .inner
            .restart_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Restart already in progress");
            return false;
        }
        let _in_flight = InFlight(&self.inner.restart_in_flight);
        warn!("Tunnel {url} no longer reported by provider, restarting");
        if let Err(e) = self.restart().await {
            error!("Tunnel restart failed: {e}");
        }
        false
    }

    /// Validate the signature headers of an inbound request.
    ///
    /// Without a configured signing secret only the presence of
    /// `X-Sovereign-Signature` is checked. With one, the signature must be
    /// the HMAC-SHA256 of `X-Sovereign-Digest`.
    pub fn validate_request_signature(&self, headers: &HeaderMap) -> bool {
        let Some(sig) = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
        else {
            warn!("Request missing signature header");
            return false;
        };

        let Some(secret) = &self.inner.settings.signing_secret else {
            debug!("No signing secret configured, accepting signature by presence");
            return true;
        };

        let Some(digest) = headers.get(DIGEST_HEADER).and_then(|v| v.to_str().ok()) else {
            warn!("Signed request missing digest header");
            return false;
        };
        let valid = signature::verify(secret.expose().as_bytes(), digest, sig);
        if !valid {
            warn!("Request signature mismatch");
        }
        valid
    }

    pub async fn status(&self) -> TunnelStatus {
        let session = self.inner.session.lock().await;
        let active = session.state == TunnelState::Active && session.public_url.is_some();
        TunnelStatus {
            active,
            public_url: if active { session.public_url.clone() } else { None },
            port: session.local_port,
            state: session.state,
            established_secs_ago: session.established_at.map(|t| t.elapsed().as_secs()),
            last_health_check_secs_ago: session.last_health_check.map(|t| t.elapsed().as_secs()),
            restarts: self.inner.restarts.load(Ordering::SeqCst),
        }
    }

    /// Exit hook: runs `stop` once. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.inner.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down tunnel supervisor");
        self.stop().await;
    }

    /// Periodic `monitor_health` in the background. The task holds a weak
    /// reference and ends once every supervisor handle is gone or after
    /// `shutdown`.
    pub fn spawn_health_monitor(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.exited.load(Ordering::SeqCst) {
                    break;
                }
                let supervisor = TunnelSupervisor { inner };
                if !supervisor.monitor_health().await {
                    debug!("Tunnel health check negative");
                }
            }
            debug!("Tunnel health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    const URL: &str = "https://abc123.example/";

    /// Scriptable in-memory provider.
    #[derive(Default)]
    struct MockProvider {
        connects: AtomicUsize,
        encryption_flags: StdMutex<Vec<bool>>,
        fail_connects: AtomicUsize,
        live: StdMutex<Vec<String>>,
        disconnects: AtomicUsize,
        terminated_now: AtomicBool,
        fail_listing: AtomicBool,
    }

    impl MockProvider {
        fn drop_tunnel(&self) {
            self.live.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl TunnelProvider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn authenticate(&self, _token: &str) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn connect(&self, _port: u16, require_encryption: bool) -> Result<String, ProviderError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.encryption_flags.lock().unwrap().push(require_encryption);
            if self.fail_connects.load(Ordering::SeqCst) > 0 {
                self.fail_connects.fetch_sub(1, Ordering::SeqCst);
                return Err(ProviderError::Auth("rejected".into()));
            }
            self.live.lock().unwrap().push(URL.to_string());
            Ok(URL.to_string())
        }

        async fn disconnect(&self, url: &str) -> Result<(), ProviderError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.live.lock().unwrap().retain(|u| u != url);
            Ok(())
        }

        async fn list_active(&self) -> Result<Vec<String>, ProviderError> {
            if self.fail_listing.load(Ordering::SeqCst) {
                return Err(ProviderError::Api {
                    status: 502,
                    message: "agent busy".into(),
                });
            }
            Ok(self.live.lock().unwrap().clone())
        }

        async fn terminate_all(&self) -> Result<(), ProviderError> {
            self.live.lock().unwrap().clear();
            Ok(())
        }

        fn terminate_now(&self) {
            self.terminated_now.store(true, Ordering::SeqCst);
        }
    }

    fn supervisor() -> (TunnelSupervisor, Arc<MockProvider>) {
        let provider = Arc::new(MockProvider::default());
        let sup = TunnelSupervisor::new(provider.clone(), SupervisorSettings::default());
        (sup, provider)
    }

    #[tokio::test]
    async fn test_start_always_requests_encryption() {
        let (sup, provider) = supervisor();
        sup.start(8000).await.unwrap();
        sup.stop().await;
        sup.start(8000).await.unwrap();
        let flags = provider.encryption_flags.lock().unwrap().clone();
        assert_eq!(flags, vec![true, true]);
    }

    #[tokio::test]
    async fn test_status_after_start() {
        let (sup, _provider) = supervisor();
        sup.start(8000).await.unwrap();
        let status = sup.status().await;
        assert!(status.active);
        assert_eq!(status.public_url.as_deref(), Some(URL));
        assert_eq!(status.port, 8000);
        assert_eq!(status.state, TunnelState::Active);
        assert_eq!(status.established_secs_ago, Some(0));
        assert_eq!(status.restarts, 0);
    }

    #[tokio::test]
    async fn test_start_failure_leaves_session_failed() {
        let (sup, provider) = supervisor();
        provider.fail_connects.store(1, Ordering::SeqCst);
        assert!(sup.start(8000).await.is_err());
        let status = sup.status().await;
        assert!(!status.active);
        assert!(status.public_url.is_none());
        assert_eq!(status.state, TunnelState::Failed);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_clears_url() {
        let (sup, provider) = supervisor();
        sup.start(8000).await.unwrap();
        sup.stop().await;
        sup.stop().await;
        let status = sup.status().await;
        assert_eq!(status.state, TunnelState::Stopped);
        assert!(status.public_url.is_none());
        assert_eq!(provider.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_monitor_health_true_when_url_present() {
        let (sup, provider) = supervisor();
        sup.start(8000).await.unwrap();
        assert!(sup.monitor_health().await);
        assert_eq!(provider.connects.load(Ordering::SeqCst), 1);
        assert_eq!(sup.status().await.last_health_check_secs_ago, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_health_restarts_once_when_url_missing() {
        let (sup, provider) = supervisor();
        sup.start(8000).await.unwrap();
        provider.drop_tunnel();

        assert!(!sup.monitor_health().await);
        assert_eq!(provider.connects.load(Ordering::SeqCst), 2);
        let status = sup.status().await;
        assert_eq!(status.restarts, 1);
        assert!(status.active);
        assert_eq!(status.port, 8000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_error_keeps_tunnel() {
        let (sup, provider) = supervisor();
        sup.start(8000).await.unwrap();
        provider.fail_listing.store(true, Ordering::SeqCst);

        assert!(!sup.monitor_health().await);
        let status = sup.status().await;
        assert!(status.active);
        assert_eq!(status.state, TunnelState::Active);
        assert_eq!(status.restarts, 0);
        assert_eq!(status.last_health_check_secs_ago, Some(0));
        assert_eq!(provider.connects.load(Ordering::SeqCst), 1);
        assert_eq!(provider.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_degraded_session_parks_url_until_teardown() {
        let (sup, provider) = supervisor();
        sup.start(8000).await.unwrap();
        provider.drop_tunnel();
        // Another check owns the restart.
        sup.inner.restart_in_flight.store(true, Ordering::SeqCst);

        assert!(!sup.monitor_health().await);
        {
            let session = sup.inner.session.lock().await;
            assert_eq!(session.state, TunnelState::Degraded);
            assert!(session.public_url.is_none());
            assert_eq!(session.stale_url.as_deref(), Some(URL));
        }
        assert!(sup.status().await.public_url.is_none());

        sup.stop().await;
        assert_eq!(provider.disconnects.load(Ordering::SeqCst), 1);
        assert!(sup.inner.session.lock().await.stale_url.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_health_checks_launch_single_restart() {
        let (sup, provider) = supervisor();
        sup.start(8000).await.unwrap();
        provider.drop_tunnel();

        let (a, b) = tokio::join!(sup.monitor_health(), sup.monitor_health());
        assert!(!a && !b);
        assert_eq!(sup.status().await.restarts, 1);
        assert_eq!(provider.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_waits_delay_and_retries() {
        let (sup, provider) = supervisor();
        sup.start(8000).await.unwrap();
        provider.fail_connects.store(1, Ordering::SeqCst);

        let started = Instant::now();
        let url = sup.restart().await.unwrap();
        assert_eq!(url, URL);
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert_eq!(provider.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_exhaustion_ends_failed() {
        let (sup, provider) = supervisor();
        sup.start(8000).await.unwrap();
        provider.fail_connects.store(10, Ordering::SeqCst);

        assert!(sup.restart().await.is_err());
        assert_eq!(provider.connects.load(Ordering::SeqCst), 4);
        assert_eq!(sup.status().await.state, TunnelState::Failed);
    }

    #[tokio::test]
    async fn test_health_check_skipped_when_stopped() {
        let (sup, provider) = supervisor();
        sup.start(8000).await.unwrap();
        sup.stop().await;
        assert!(!sup.monitor_health().await);
        assert_eq!(provider.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_runs_once_and_blocks_start() {
        let (sup, provider) = supervisor();
        sup.start(8000).await.unwrap();
        sup.shutdown().await;
        sup.shutdown().await;
        assert_eq!(sup.status().await.state, TunnelState::Stopped);
        assert!(matches!(sup.start(8000).await, Err(ProviderError::ShutDown)));
        drop(sup);
        assert!(!provider.terminated_now.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drop_without_shutdown_terminates_provider() {
        let (sup, provider) = supervisor();
        sup.start(8000).await.unwrap();
        drop(sup);
        assert!(provider.terminated_now.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_monitor_exits_when_supervisor_dropped() {
        let (sup, _provider) = supervisor();
        sup.start(8000).await.unwrap();
        let handle = sup.spawn_health_monitor(Duration::from_secs(30));
        drop(sup);
        tokio::time::timeout(Duration::from_secs(120), handle)
            .await
            .expect("monitor should exit")
            .unwrap();
    }

    #[test]
    fn test_signature_presence_only_without_secret() {
        let (sup, _provider) = supervisor();
        let mut headers = HeaderMap::new();
        assert!(!sup.validate_request_signature(&headers));
        headers.insert(SIGNATURE_HEADER, "anything".parse().unwrap());
        assert!(sup.validate_request_signature(&headers));
    }

    #[test]
    fn test_signature_verified_with_secret() {
        let provider = Arc::new(MockProvider::default());
        let sup = TunnelSupervisor::new(
            provider,
            SupervisorSettings {
                signing_secret: Some(Secret::new("hmac-key")),
                ..SupervisorSettings::default()
            },
        );
        let digest = "00112233445566778899aabbccddeeff";
        let mut headers = HeaderMap::new();
        headers.insert(DIGEST_HEADER, digest.parse().unwrap());
        headers.insert(SIGNATURE_HEADER, "deadbeef".parse().unwrap());
        assert!(!sup.validate_request_signature(&headers));

        let sig = signature::sign(b"hmac-key", digest).unwrap();
        headers.insert(SIGNATURE_HEADER, sig.parse().unwrap());
        assert!(sup.validate_request_signature(&headers));
    }
}

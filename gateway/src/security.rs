//! Authentication-failure monitor.
//!
//! Repeated 401/403 answers from the remote mean either our credentials are
//! stale or someone else is on the other end of the tunnel. After
//! `max_failures` within `window` the tunnel is marked compromised and the
//! dispatcher stops sending requests until an operator calls [`reset`].
//!
//! [`reset`]: AuthFailureMonitor::reset

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::SecurityConfig;

/// Failures kept for inspection.
const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone)]
struct AuthFailure {
    at: Instant,
    status: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityStatus {
    pub compromised: bool,
    pub total_failures: u64,
    pub recent_failures: usize,
    pub last_status: Option<u16>,
}

pub struct AuthFailureMonitor {
    max_failures: usize,
    window: Duration,
    history: Mutex<VecDeque<AuthFailure>>,
    compromised: AtomicBool,
    total: AtomicU64,
}

impl AuthFailureMonitor {
    pub fn new(max_failures: usize, window: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            window,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
            compromised: AtomicBool::new(false),
            total: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(
            config.max_auth_failures,
            Duration::from_secs(config.failure_window_secs),
        )
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<AuthFailure>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn recent(&self, history: &VecDeque<AuthFailure>, now: Instant) -> usize {
        history
            .iter()
            .filter(|f| now.duration_since(f.at) < self.window)
            .count()
    }

    /// Record one rejected request. Returns true if the tunnel is now
    /// considered compromised.
    pub fn record_failure(&self, status: u16) -> bool {
        let now = Instant::now();
        self.total.fetch_add(1, Ordering::SeqCst);
        let mut history = self.history();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(AuthFailure { at: now, status });

        let recent = self.recent(&history, now);
        warn!(status, recent, "Remote authentication failure recorded");
        if recent >= self.max_failures && !self.compromised.swap(true, Ordering::SeqCst) {
            error!(
                recent,
                window_secs = self.window.as_secs(),
                "Repeated authentication failures, blocking remote dispatch"
            );
        }
        self.compromised.load(Ordering::SeqCst)
    }

    pub fn is_compromised(&self) -> bool {
        self.compromised.load(Ordering::SeqCst)
    }

    /// Operator action: clear history and unblock dispatch.
    pub fn reset(&self) {
        self.history().clear();
        self.compromised.store(false, Ordering::SeqCst);
        info!("Authentication failure monitor reset");
    }

    pub fn status(&self) -> SecurityStatus {
        let history = self.history();
        SecurityStatus {
            compromised: self.is_compromised(),
            total_failures: self.total.load(Ordering::SeqCst),
            recent_failures: self.recent(&history, Instant::now()),
            last_status: history.back().map(|f| f.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_in_window_compromise() {
        let monitor = AuthFailureMonitor::new(3, Duration::from_secs(60));
        assert!(!monitor.record_failure(401));
        assert!(!monitor.record_failure(401));
        assert!(monitor.record_failure(403));
        assert!(monitor.is_compromised());

        let status = monitor.status();
        assert_eq!(status.total_failures, 3);
        assert_eq!(status.last_status, Some(403));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let monitor = AuthFailureMonitor::new(3, Duration::from_secs(60));
        monitor.record_failure(401);
        monitor.record_failure(401);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!monitor.record_failure(401));
        assert_eq!(monitor.status().recent_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_unblocks() {
        let monitor = AuthFailureMonitor::new(1, Duration::from_secs(60));
        assert!(monitor.record_failure(401));
        monitor.reset();
        assert!(!monitor.is_compromised());
        assert_eq!(monitor.status().recent_failures, 0);
        assert_eq!(monitor.status().total_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_bounded() {
        let monitor = AuthFailureMonitor::new(1000, Duration::from_secs(60));
        for _ in 0..150 {
            monitor.record_failure(401);
        }
        assert_eq!(monitor.status().recent_failures, HISTORY_LIMIT);
        assert_eq!(monitor.status().total_failures, 150);
    }
}

//! Encrypted tunnel between the gateway and the remote brain.
//!
//! - `provider` — the [`TunnelProvider`] seam and its error type
//! - `ngrok` — provider driving the ngrok agent API
//! - `fixed` — provider for an externally established URL
//! - `supervisor` — session state machine, health monitoring, restarts

pub mod fixed;
pub mod ngrok;
pub mod provider;
pub mod supervisor;

pub use fixed::FixedUrlProvider;
pub use ngrok::NgrokAgent;
pub use provider::{ProviderError, TunnelProvider};
pub use supervisor::{SupervisorSettings, TunnelState, TunnelStatus, TunnelSupervisor};

//! Error taxonomy for the gateway.
//!
//! Every [`GatewayError`] belongs to an [`ErrorCategory`] so callers can
//! decide what to do without matching on individual variants: connection
//! errors mean "the remote path is unusable right now", authentication
//! errors must never be retried, provider errors are fatal for the tunnel.

use std::fmt;

use thiserror::Error;

use crate::client::ClientError;
use crate::config::ConfigError;
use crate::tunnel::ProviderError;

/// Broad classification of a gateway failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Tunnel down, remote unreachable, or dispatch blocked.
    Connection,
    /// The remote rejected our credentials.
    Authentication,
    /// The tunnel provider refused an operation.
    Provider,
    /// The remote answered with a non-retryable error.
    Remote,
    /// Invalid configuration.
    Configuration,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Connection => write!(f, "connection"),
            ErrorCategory::Authentication => write!(f, "authentication"),
            ErrorCategory::Provider => write!(f, "provider"),
            ErrorCategory::Remote => write!(f, "remote"),
            ErrorCategory::Configuration => write!(f, "configuration"),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("remote brain tunnel is not active")]
    TunnelUnavailable,
    #[error("remote dispatch blocked after repeated authentication failures")]
    Blocked,
    #[error("tunnel provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("remote rejected request (HTTP {status}): {message}")]
    Remote { status: u16, message: String },
    #[error("remote client error: {0}")]
    Client(ClientError),
    #[error("remote inference failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GatewayError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::TunnelUnavailable
            | GatewayError::Blocked
            | GatewayError::RetriesExhausted { .. } => ErrorCategory::Connection,
            GatewayError::Remote {
                status: 401 | 403, ..
            } => ErrorCategory::Authentication,
            GatewayError::Remote { .. } | GatewayError::Client(_) => ErrorCategory::Remote,
            GatewayError::Provider(_) => ErrorCategory::Provider,
            GatewayError::Config(_) => ErrorCategory::Configuration,
        }
    }

    /// True when the remote path is unusable and a caller may try again later.
    pub fn is_connection(&self) -> bool {
        self.category() == ErrorCategory::Connection
    }

    pub fn is_auth_failure(&self) -> bool {
        self.category() == ErrorCategory::Authentication
    }
}

impl From<ClientError> for GatewayError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Remote { status, message } => GatewayError::Remote { status, message },
            other => GatewayError::Client(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert!(GatewayError::TunnelUnavailable.is_connection());
        assert!(GatewayError::Blocked.is_connection());
        assert!(GatewayError::RetriesExhausted {
            attempts: 3,
            last: "timeout".into()
        }
        .is_connection());

        let unauthorized = GatewayError::Remote {
            status: 401,
            message: "Invalid access token".into(),
        };
        assert!(unauthorized.is_auth_failure());
        assert!(!unauthorized.is_connection());

        let bad_request = GatewayError::Remote {
            status: 422,
            message: "Missing 'query' field".into(),
        };
        assert_eq!(bad_request.category(), ErrorCategory::Remote);
    }

    #[test]
    fn test_remote_client_error_maps_to_remote() {
        let err: GatewayError = ClientError::Remote {
            status: 403,
            message: "forbidden".into(),
        }
        .into();
        assert!(matches!(err, GatewayError::Remote { status: 403, .. }));
    }

    #[test]
    fn test_display_includes_status() {
        let err = GatewayError::Remote {
            status: 401,
            message: "Invalid access token".into(),
        };
        assert_eq!(
            err.to_string(),
            "remote rejected request (HTTP 401): Invalid access token"
        );
    }
}

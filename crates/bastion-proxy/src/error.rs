//! Error types for the proxy.

use std::net::SocketAddr;

use bastion_admission::AdmissionError;
use thiserror::Error;

/// Errors that can occur in the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed to bind the listener.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),

    /// Failed to reach the backend.
    #[error("failed to connect to backend {backend}: {reason}")]
    BackendConnect {
        /// Backend address as configured.
        backend: String,
        /// What went wrong.
        reason: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Admission pipeline error.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_bind_failed_error_display() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 25565);
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = ProxyError::BindFailed(addr, io_err);

        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:25565"));
        assert!(msg.contains("address in use"));
    }

    #[test]
    fn test_backend_connect_display() {
        let err = ProxyError::BackendConnect {
            backend: "10.1.0.5:25566".to_string(),
            reason: "timed out".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to connect to backend 10.1.0.5:25566: timed out"
        );
    }

    #[test]
    fn test_from_admission_error_is_transparent() {
        let err: ProxyError = AdmissionError::Config("bad window".to_string()).into();
        assert_eq!(err.to_string(), "configuration error: bad window");
        assert!(matches!(err, ProxyError::Admission(_)));
    }
}

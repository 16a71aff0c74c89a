//! Error types for admission control.

use std::net::IpAddr;

use thiserror::Error;

use crate::verdict::ReasonCode;

/// Errors that can occur in admission operations.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Address is blocked.
    #[error("address {address} is blocked: {reason}")]
    Blocked {
        /// The blocked address.
        address: IpAddr,
        /// Reason recorded with the block.
        reason: ReasonCode,
    },

    /// Too many live connections from one address.
    #[error("connection limit exceeded for {address}: {current}/{max}")]
    ConnectionLimit {
        /// The address.
        address: IpAddr,
        /// Current live connection count.
        current: u32,
        /// Maximum allowed.
        max: u32,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AdmissionError {
    /// Reason code reported when this error rejects a connection.
    #[must_use]
    pub const fn reason(&self) -> ReasonCode {
        match self {
            Self::Blocked { reason, .. } => *reason,
            Self::ConnectionLimit { .. } => ReasonCode::ConnectionLimit,
            Self::Config(_) | Self::Internal(_) => ReasonCode::InternalFault,
        }
    }
}

/// Result type for admission operations.
pub type AdmissionResult<T> = Result<T, AdmissionError>;

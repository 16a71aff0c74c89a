//! Stage verdicts and reason codes.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Why a connection was throttled or blocked.
///
/// Reason codes are only ever reported to operators through the audit sink;
/// rejected peers receive no explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Handshake framing was invalid, too large, or too slow.
    MalformedHandshake,
    /// Connection rate exceeded the sliding-window threshold.
    RateExceeded,
    /// Address is blocked or its reputation crossed the block score.
    ReputationBlocked,
    /// Detection engine did not answer in time (fail-closed).
    ClassificationTimeout,
    /// Detection engine classified the connection as hostile.
    ClassificationRejected,
    /// A stage failed unexpectedly.
    InternalFault,
    /// Too many live connections from one address.
    ConnectionLimit,
    /// Operator placed a block by hand.
    ManualBlock,
}

impl ReasonCode {
    /// Stable string form used in logs and audit records.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedHandshake => "malformed_handshake",
            Self::RateExceeded => "rate_exceeded",
            Self::ReputationBlocked => "reputation_blocked",
            Self::ClassificationTimeout => "classification_timeout",
            Self::ClassificationRejected => "classification_rejected",
            Self::InternalFault => "internal_fault",
            Self::ConnectionLimit => "connection_limit",
            Self::ManualBlock => "manual_block",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Continue to the next stage.
    Allow,
    /// Delay progression, then re-evaluate.
    Throttle {
        /// Why the connection was throttled.
        reason: ReasonCode,
        /// How long to wait before asking again.
        retry_after: Duration,
    },
    /// Reject the connection.
    Block {
        /// Why the connection was blocked.
        reason: ReasonCode,
        /// How long the address stays blocked (`None` = permanent or
        /// connection-scoped).
        duration: Option<Duration>,
    },
}

impl Verdict {
    /// Block for the lifetime of this connection only.
    #[must_use]
    pub const fn reject(reason: ReasonCode) -> Self {
        Self::Block {
            reason,
            duration: None,
        }
    }

    /// Check if the verdict allows the connection to proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Check if the verdict is a throttle.
    #[must_use]
    pub const fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttle { .. })
    }

    /// Check if the verdict is a block.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::Block { .. })
    }

    /// Reason code, if any.
    #[must_use]
    pub const fn reason(&self) -> Option<ReasonCode> {
        match self {
            Self::Allow => None,
            Self::Throttle { reason, .. } | Self::Block { reason, .. } => Some(*reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_allow() {
        let verdict = Verdict::Allow;
        assert!(verdict.is_allowed());
        assert!(!verdict.is_throttled());
        assert!(!verdict.is_blocked());
        assert_eq!(verdict.reason(), None);
    }

    #[test]
    fn test_verdict_throttle() {
        let verdict = Verdict::Throttle {
            reason: ReasonCode::RateExceeded,
            retry_after: Duration::from_millis(250),
        };
        assert!(verdict.is_throttled());
        assert_eq!(verdict.reason(), Some(ReasonCode::RateExceeded));
    }

    #[test]
    fn test_verdict_reject_has_no_duration() {
        let verdict = Verdict::reject(ReasonCode::MalformedHandshake);
        assert!(verdict.is_blocked());
        assert!(matches!(verdict, Verdict::Block { duration: None, .. }));
    }

    #[test]
    fn test_reason_code_serde_matches_display() {
        let json = serde_json::to_string(&ReasonCode::ClassificationTimeout).unwrap();
        assert_eq!(json, "\"classification_timeout\"");
        assert_eq!(ReasonCode::ClassificationTimeout.to_string(), "classification_timeout");
    }
}

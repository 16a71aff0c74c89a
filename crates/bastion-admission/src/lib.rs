//! # bastion-admission
//!
//! Connection admission control for game servers.
//!
//! Every new connection passes through a fixed sequence of stages before a
//! single byte reaches the protected backend:
//!
//! ## Stages
//!
//! - [`ConnectionRegistry`] - One record per live connection, per-address cap,
//!   blocklist gate
//! - [`ReputationLimiter`] - Sliding-window rate limits, decaying reputation,
//!   escalating blocks
//! - [`HandshakeValidator`] - Byte budget, timeout, and framing checks on the
//!   first packet
//! - [`DetectionEngine`] - Pluggable classification with a timeout and a
//!   fail-open/fail-closed policy
//!
//! [`AdmissionPipeline`] runs the stages in order and emits an
//! [`AuditRecord`] for every rejection and every degraded admission.
//!
//! ## Configuration
//!
//! - [`ShieldConfig`] - Unified configuration with sensible defaults, loadable
//!   from TOML
//!
//! # Example
//!
//! ```rust
//! use bastion_admission::{Admission, AdmissionPipeline, ShieldConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(mut socket: tokio::net::TcpStream) -> bastion_admission::AdmissionResult<()> {
//! let pipeline = AdmissionPipeline::new(ShieldConfig::default())?;
//! let peer = socket.peer_addr().map_or([127, 0, 0, 1].into(), |a| a.ip());
//!
//! match pipeline.admit(peer, &mut socket, &CancellationToken::new()).await {
//!     Admission::Admitted(conn) => {
//!         // forward conn.buffered(), then pump the socket to the backend
//!         let _ = conn.handshake();
//!     }
//!     Admission::Rejected(rejection) => println!("rejected: {}", rejection.reason),
//!     Admission::Cancelled => {}
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod blocklist;
pub mod config;
pub mod detection;
pub mod error;
pub mod handshake;
pub mod limiter;
pub mod pipeline;
pub mod registry;
pub mod verdict;

// Re-export main types
pub use audit::{
    AuditKind, AuditRecord, AuditSink, ChannelAuditSink, MemoryAuditSink, NoopAuditSink,
    TracingAuditSink,
};
pub use blocklist::{BlockStatus, Blocklist};
pub use config::{
    BlocklistConfig, DetectionConfig, FailurePolicy, HandshakeConfig, HeuristicConfig,
    LimiterConfig, PipelineConfig, RegistryConfig, ReputationConfig, ShieldConfig,
    ShieldConfigBuilder,
};
pub use detection::{AllowAll, Assessment, DetectionEngine, DetectionError, DetectorChain, HeuristicDetector};
pub use error::{AdmissionError, AdmissionResult};
pub use handshake::{
    Handshake, HandshakeCursor, HandshakeError, HandshakeResult, HandshakeValidator, NextState,
    read_handshake, watch_closed,
};
pub use limiter::{ReputationEntry, ReputationLimiter};
pub use pipeline::{
    Admission, AdmissionPipeline, AdmissionPipelineBuilder, AdmittedConnection, PipelineStats,
    Rejection, SweepReport,
};
pub use registry::{ConnectionKey, ConnectionLease, ConnectionRecord, ConnectionRegistry, ConnectionState};
pub use verdict::{ReasonCode, Verdict};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::audit::{AuditRecord, AuditSink};
    pub use crate::config::{FailurePolicy, ShieldConfig};
    pub use crate::detection::{DetectionEngine, DetectionError};
    pub use crate::error::{AdmissionError, AdmissionResult};
    pub use crate::handshake::Handshake;
    pub use crate::pipeline::{Admission, AdmissionPipeline, AdmittedConnection, Rejection};
    pub use crate::registry::ConnectionRecord;
    pub use crate::verdict::{ReasonCode, Verdict};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_shared_blocklist_gates_registry_and_limiter() {
        let config = ShieldConfig::default();
        let blocklist = Arc::new(Blocklist::from_config(&config.blocklist));
        let registry = Arc::new(ConnectionRegistry::new(&config.registry, Arc::clone(&blocklist)));
        let limiter = ReputationLimiter::new(
            config.limiter.clone(),
            config.reputation.clone(),
            &config.blocklist,
            Arc::clone(&blocklist),
        );
        let ip: IpAddr = "10.0.0.3".parse().unwrap();

        blocklist.block(&ip, ReasonCode::ManualBlock, Some(Duration::from_secs(60)));

        assert!(registry.register(ip).is_err());
        assert!(limiter.check(&ip).is_blocked());
    }

    #[test]
    fn test_limiter_escalation_blocks_registration() {
        let config = ShieldConfig::builder()
            .limiter(LimiterConfig {
                max_events_per_window: 1,
                escalation_threshold: 1,
                ..LimiterConfig::default()
            })
            .build();
        let pipeline = AdmissionPipeline::new(config).unwrap();
        let ip: IpAddr = "10.0.0.4".parse().unwrap();

        assert!(pipeline.limiter().check(&ip).is_allowed());
        assert!(pipeline.limiter().check(&ip).is_blocked());

        let err = pipeline.registry().register(ip).unwrap_err();
        assert_eq!(err.reason(), ReasonCode::RateExceeded);
    }
}

//! Admission pipeline.
//!
//! Runs every new connection through the stages in a fixed order:
//!
//! 1. registry (blocklist and per-address cap)
//! 2. rate/reputation limiter (throttle waits, escalation)
//! 3. handshake validation (byte budget, timeout)
//! 4. detection engine (timeout, failure policy)
//!
//! A block from any stage rejects the connection on the spot. Every wait is
//! raced against the connection's [`CancellationToken`] and against the peer
//! closing the stream. The registry record lives in a [`ConnectionLease`] so
//! it is released on every exit path, including the caller dropping the
//! future.

use std::fmt;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditKind, AuditRecord, AuditSink, TracingAuditSink};
use crate::blocklist::Blocklist;
use crate::config::{FailurePolicy, ShieldConfig};
use crate::detection::{DetectionEngine, HeuristicDetector};
use crate::error::{AdmissionError, AdmissionResult};
use crate::handshake::{
    Handshake, HandshakeCursor, HandshakeValidator, read_handshake, watch_closed,
};
use crate::limiter::ReputationLimiter;
use crate::registry::{ConnectionKey, ConnectionLease, ConnectionRegistry, ConnectionState};
use crate::verdict::{ReasonCode, Verdict};

/// Smallest throttle delay, so a zero `retry_after` cannot spin.
const MIN_THROTTLE_DELAY: Duration = Duration::from_millis(1);

/// A connection that passed every stage.
#[derive(Debug)]
pub struct AdmittedConnection {
    lease: ConnectionLease,
    handshake: Handshake,
    buffered: Vec<u8>,
    degraded: bool,
}

impl AdmittedConnection {
    /// Registry lease; dropping it releases the record.
    #[must_use]
    pub const fn lease(&self) -> &ConnectionLease {
        &self.lease
    }

    /// Connection identity.
    #[must_use]
    pub const fn key(&self) -> &ConnectionKey {
        self.lease.key()
    }

    /// Parsed handshake.
    #[must_use]
    pub const fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Bytes read during validation, which must be forwarded first.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.buffered
    }

    /// Whether the connection was admitted without a classification.
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Split into lease, handshake, and buffered bytes.
    #[must_use]
    pub fn into_parts(self) -> (ConnectionLease, Handshake, Vec<u8>) {
        (self.lease, self.handshake, self.buffered)
    }
}

/// Why and where a connection was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Peer address.
    pub address: IpAddr,
    /// Registry connection id, if one was assigned.
    pub connection_id: Option<u64>,
    /// Reason code.
    pub reason: ReasonCode,
    /// Last state reached before rejection.
    pub state: ConnectionState,
    /// Block placed on the address as a consequence, if any.
    pub block_duration: Option<Duration>,
}

/// Outcome of [`AdmissionPipeline::admit`].
#[derive(Debug)]
pub enum Admission {
    /// Forward the connection to the backend.
    Admitted(AdmittedConnection),
    /// Close the connection without explanation.
    Rejected(Rejection),
    /// The connection went away while a stage was waiting.
    Cancelled,
}

impl Admission {
    /// Check if the connection was admitted.
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }

    /// The rejection, if the connection was rejected.
    #[must_use]
    pub const fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }
}

/// Counters since the pipeline was built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Connections admitted (including degraded).
    pub admitted: u64,
    /// Connections rejected.
    pub rejected: u64,
    /// Throttle delays served.
    pub throttled: u64,
    /// Connections admitted without classification.
    pub degraded: u64,
    /// Rejections that escalated into an address block.
    pub escalated: u64,
    /// Admissions abandoned by the peer.
    pub cancelled: u64,
    /// Live registry records.
    pub active_connections: u64,
    /// Addresses known to the registry.
    pub tracked_addresses: usize,
    /// Addresses with limiter state.
    pub reputation_entries: usize,
    /// Blocklist entries.
    pub blocked_addresses: usize,
}

/// Result of a maintenance sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired blocks removed.
    pub expired_blocks: usize,
    /// Idle reputation entries evicted.
    pub idle_entries: usize,
    /// Stale registry addresses forgotten.
    pub stale_addresses: usize,
}

#[derive(Debug, Default)]
struct Counters {
    admitted: AtomicU64,
    rejected: AtomicU64,
    throttled: AtomicU64,
    degraded: AtomicU64,
    escalated: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Why classification produced no verdict.
#[derive(Debug, Clone, Copy)]
enum ClassifyFailure {
    Timeout,
    Fault,
}

impl ClassifyFailure {
    const fn reason(self) -> ReasonCode {
        match self {
            Self::Timeout => ReasonCode::ClassificationTimeout,
            Self::Fault => ReasonCode::InternalFault,
        }
    }
}

/// Builder for [`AdmissionPipeline`].
pub struct AdmissionPipelineBuilder {
    config: ShieldConfig,
    detector: Option<Arc<dyn DetectionEngine>>,
    audit: Option<Arc<dyn AuditSink>>,
    blocklist: Option<Arc<Blocklist>>,
}

impl AdmissionPipelineBuilder {
    /// Use a custom detection engine.
    #[must_use]
    pub fn detector(mut self, detector: Arc<dyn DetectionEngine>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Send audit records to `sink`.
    #[must_use]
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Share an existing blocklist.
    #[must_use]
    pub fn blocklist(mut self, blocklist: Arc<Blocklist>) -> Self {
        self.blocklist = Some(blocklist);
        self
    }

    /// Validate the configuration and build the pipeline.
    pub fn build(self) -> AdmissionResult<AdmissionPipeline> {
        let config = self.config;
        config.validate()?;

        let blocklist = self
            .blocklist
            .unwrap_or_else(|| Arc::new(Blocklist::from_config(&config.blocklist)));
        let registry = Arc::new(ConnectionRegistry::new(
            &config.registry,
            Arc::clone(&blocklist),
        ));
        let limiter = ReputationLimiter::new(
            config.limiter.clone(),
            config.reputation.clone(),
            &config.blocklist,
            Arc::clone(&blocklist),
        );
        let validator = HandshakeValidator::new(config.handshake.clone());
        let detector = self.detector.unwrap_or_else(|| {
            Arc::new(HeuristicDetector::new(config.detection.heuristic.clone()))
        });
        let audit = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));

        info!(
            detector = detector.name(),
            failure_policy = ?config.detection.failure_policy,
            "Admission pipeline ready"
        );

        Ok(AdmissionPipeline {
            config,
            blocklist,
            registry,
            limiter,
            validator,
            detector,
            audit,
            counters: Counters::default(),
        })
    }
}

/// Orchestrates the admission stages for every new connection.
pub struct AdmissionPipeline {
    config: ShieldConfig,
    blocklist: Arc<Blocklist>,
    registry: Arc<ConnectionRegistry>,
    limiter: ReputationLimiter,
    validator: HandshakeValidator,
    detector: Arc<dyn DetectionEngine>,
    audit: Arc<dyn AuditSink>,
    counters: Counters,
}

impl fmt::Debug for AdmissionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPipeline")
            .field("detector", &self.detector.name())
            .field("failure_policy", &self.config.detection.failure_policy)
            .field("active_connections", &self.registry.active_connections())
            .finish_non_exhaustive()
    }
}

impl AdmissionPipeline {
    /// Build a pipeline with the default detector and audit sink.
    pub fn new(config: ShieldConfig) -> AdmissionResult<Self> {
        Self::builder(config).build()
    }

    /// Start building a pipeline.
    #[must_use]
    pub fn builder(config: ShieldConfig) -> AdmissionPipelineBuilder {
        AdmissionPipelineBuilder {
            config,
            detector: None,
            audit: None,
            blocklist: None,
        }
    }

    /// Run a new connection through every stage.
    ///
    /// Reads only the handshake, plus whatever arrives while a stage is
    /// waiting, from `stream`; the caller forwards
    /// [`AdmittedConnection::buffered`] and then the rest of the stream.
    /// A peer that closes before a verdict yields [`Admission::Cancelled`].
    pub async fn admit<S>(
        &self,
        address: IpAddr,
        stream: &mut S,
        cancel: &CancellationToken,
    ) -> Admission
    where
        S: AsyncRead + Unpin + Send,
    {
        // Registry
        let lease = match self.registry.register(address) {
            Ok(lease) => lease,
            Err(err) => {
                let (reason, duration) = match &err {
                    AdmissionError::Blocked { address, .. } => (
                        err.reason(),
                        self.blocklist.status(address).and_then(|s| s.remaining),
                    ),
                    AdmissionError::ConnectionLimit { address, .. } => {
                        (err.reason(), self.penalize(address, err.reason()))
                    }
                    AdmissionError::Config(_) | AdmissionError::Internal(_) => (err.reason(), None),
                };
                debug!(ip = %address, error = %err, "Registration refused");
                return self.reject(address, None, ConnectionState::New, reason, duration, None);
            }
        };

        let budget = self.config.handshake.max_bytes;
        let mut cursor = HandshakeCursor::new();

        // Rate and reputation
        let mut waited = Duration::ZERO;
        loop {
            match self.limiter.check(&address) {
                Verdict::Allow => break,
                Verdict::Throttle { reason, retry_after } => {
                    let delay = retry_after.max(MIN_THROTTLE_DELAY);
                    waited = waited.saturating_add(delay);
                    if waited > self.config.pipeline.max_throttle_wait() {
                        debug!(ip = %address, waited_ms = waited.as_millis() as u64, "Throttle wait exhausted");
                        return self.reject(address, Some(lease), ConnectionState::Registered, reason, None, None);
                    }

                    Counters::bump(&self.counters.throttled);
                    debug!(connection = %lease.key(), delay_ms = delay.as_millis() as u64, "Throttling connection");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return self.cancelled(&lease),
                        () = watch_closed(stream, &mut cursor, budget) => return self.cancelled(&lease),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Verdict::Block { reason, duration } => {
                    return self.reject(address, Some(lease), ConnectionState::Registered, reason, duration, None);
                }
            }
        }

        // Handshake
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return self.cancelled(&lease),
            result = read_handshake(stream, &self.validator, &mut cursor) => result,
        };
        lease.update(cursor.len() as u64);

        let handshake = match result {
            Ok(handshake) => handshake,
            Err(err) if err.is_disconnect() => {
                debug!(connection = %lease.key(), error = %err, "Peer left during handshake");
                return self.cancelled(&lease);
            }
            Err(err) => {
                debug!(connection = %lease.key(), error = %err, "Handshake rejected");
                let reason = ReasonCode::MalformedHandshake;
                let duration = self.penalize(&address, reason);
                return self.reject(
                    address,
                    Some(lease),
                    ConnectionState::Registered,
                    reason,
                    duration,
                    Some(err.to_string()),
                );
            }
        };
        lease.set_state(ConnectionState::HandshakeValidated);

        // Detection
        if let Some(score) = self.limiter.score(&address) {
            self.registry.set_reputation(lease.key(), score);
        }
        let Some(record) = lease.record() else {
            warn!(connection = %lease.key(), "Registry record vanished during admission");
            return self.reject(
                address,
                Some(lease),
                ConnectionState::HandshakeValidated,
                ReasonCode::InternalFault,
                None,
                None,
            );
        };

        let timeout = self.config.detection.classify_timeout();
        let classify = AssertUnwindSafe(self.detector.classify(&record, &handshake)).catch_unwind();
        let before = cursor.len();
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return self.cancelled(&lease),
            outcome = tokio::time::timeout(timeout, classify) => outcome,
            () = watch_closed(stream, &mut cursor, budget) => return self.cancelled(&lease),
        };
        if cursor.len() > before {
            lease.update((cursor.len() - before) as u64);
        }

        let verdict = match outcome {
            Ok(Ok(Ok(verdict))) => verdict,
            Ok(Ok(Err(err))) => {
                error!(connection = %lease.key(), engine = self.detector.name(), error = %err, "Detection engine failed");
                return self.resolve_failure(lease, handshake, cursor, ClassifyFailure::Fault);
            }
            Ok(Err(_panic)) => {
                error!(connection = %lease.key(), engine = self.detector.name(), "Detection engine panicked");
                return self.resolve_failure(lease, handshake, cursor, ClassifyFailure::Fault);
            }
            Err(_elapsed) => {
                warn!(
                    connection = %lease.key(),
                    engine = self.detector.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Detection timed out"
                );
                return self.resolve_failure(lease, handshake, cursor, ClassifyFailure::Timeout);
            }
        };
        lease.set_state(ConnectionState::Classified);

        match verdict {
            Verdict::Allow => self.admitted(lease, handshake, cursor, false),
            Verdict::Throttle { reason, .. } => {
                let penalty = self.config.reputation.suspicion_penalty;
                if let Some(Verdict::Block { reason, duration }) = self.limiter.penalize_by(&address, penalty) {
                    return self.reject(address, Some(lease), ConnectionState::Classified, reason, duration, None);
                }
                debug!(connection = %lease.key(), reason = %reason, "Admitting suspicious connection");
                self.admitted(lease, handshake, cursor, false)
            }
            Verdict::Block { reason, duration } => {
                let mut block = self.penalize(&address, reason);
                if duration.is_some() {
                    block = self.blocklist.block(&address, reason, duration);
                }
                self.reject(address, Some(lease), ConnectionState::Classified, reason, block, None)
            }
        }
    }

    fn resolve_failure(
        &self,
        lease: ConnectionLease,
        handshake: Handshake,
        cursor: HandshakeCursor,
        failure: ClassifyFailure,
    ) -> Admission {
        let reason = failure.reason();
        let address = lease.address();

        match self.config.detection.failure_policy {
            FailurePolicy::FailOpen => {
                lease.set_state(ConnectionState::Classified);
                Counters::bump(&self.counters.degraded);
                self.audit.record(
                    &AuditRecord::new(AuditKind::Degraded, address, reason, ConnectionState::Classified)
                        .with_connection(lease.key().id)
                        .with_detail(format!("detector '{}' gave no verdict", self.detector.name())),
                );
                self.admitted(lease, handshake, cursor, true)
            }
            FailurePolicy::FailClosed => {
                let duration = self.penalize(&address, reason);
                self.reject(address, Some(lease), ConnectionState::HandshakeValidated, reason, duration, None)
            }
        }
    }

    fn admitted(
        &self,
        lease: ConnectionLease,
        handshake: Handshake,
        cursor: HandshakeCursor,
        degraded: bool,
    ) -> Admission {
        lease.set_state(ConnectionState::Admitted);
        Counters::bump(&self.counters.admitted);
        info!(
            connection = %lease.key(),
            protocol = handshake.protocol_version,
            next_state = %handshake.next_state,
            degraded,
            "Connection admitted"
        );
        Admission::Admitted(AdmittedConnection {
            lease,
            handshake,
            buffered: cursor.into_bytes(),
            degraded,
        })
    }

    fn reject(
        &self,
        address: IpAddr,
        lease: Option<ConnectionLease>,
        state: ConnectionState,
        reason: ReasonCode,
        block_duration: Option<Duration>,
        detail: Option<String>,
    ) -> Admission {
        let connection_id = lease.as_ref().map(|l| l.key().id);
        if let Some(lease) = &lease {
            lease.set_state(ConnectionState::Rejected);
        }

        let escalated = reason == ReasonCode::RateExceeded && block_duration.is_some();
        let kind = if escalated {
            Counters::bump(&self.counters.escalated);
            AuditKind::Escalated
        } else {
            AuditKind::Rejected
        };
        Counters::bump(&self.counters.rejected);

        let mut record = AuditRecord::new(kind, address, reason, state).with_block_duration(block_duration);
        record.connection_id = connection_id;
        if let Some(detail) = detail {
            record = record.with_detail(detail);
        }
        self.audit.record(&record);

        // Releases the registry record.
        drop(lease);

        Admission::Rejected(Rejection {
            address,
            connection_id,
            reason,
            state,
            block_duration,
        })
    }

    fn cancelled(&self, lease: &ConnectionLease) -> Admission {
        Counters::bump(&self.counters.cancelled);
        debug!(connection = %lease.key(), "Admission cancelled");
        Admission::Cancelled
    }

    /// Penalize and return the resulting block duration, if any.
    fn penalize(&self, address: &IpAddr, reason: ReasonCode) -> Option<Duration> {
        match self.limiter.penalize(address, reason) {
            Some(Verdict::Block { duration, .. }) => duration,
            _ => None,
        }
    }

    /// Block an address by operator action. `None` blocks permanently.
    pub fn block(&self, address: &IpAddr, duration: Option<Duration>) -> Option<Duration> {
        self.blocklist.block(address, ReasonCode::ManualBlock, duration)
    }

    /// Lift a block. Returns whether one existed.
    pub fn unblock(&self, address: &IpAddr) -> bool {
        self.blocklist.unblock(address)
    }

    /// Remove expired and idle state.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// Remove state expired or idle as of `now`.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let report = SweepReport {
            expired_blocks: self.blocklist.purge_expired_at(now),
            idle_entries: self.limiter.purge_idle(now),
            stale_addresses: self.registry.purge_stale_at(now),
        };
        if report != SweepReport::default() {
            debug!(?report, "Sweep complete");
        }
        report
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            admitted: c.admitted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            throttled: c.throttled.load(Ordering::Relaxed),
            degraded: c.degraded.load(Ordering::Relaxed),
            escalated: c.escalated.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            active_connections: self.registry.active_connections(),
            tracked_addresses: self.registry.tracked_addresses(),
            reputation_entries: self.limiter.tracked_count(),
            blocked_addresses: self.blocklist.len(),
        }
    }

    /// Pipeline configuration.
    #[must_use]
    pub const fn config(&self) -> &ShieldConfig {
        &self.config
    }

    /// Connection registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Rate and reputation limiter.
    #[must_use]
    pub const fn limiter(&self) -> &ReputationLimiter {
        &self.limiter
    }

    /// Shared blocklist.
    #[must_use]
    pub const fn blocklist(&self) -> &Arc<Blocklist> {
        &self.blocklist
    }

    /// Name of the detection engine.
    #[must_use]
    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }
}

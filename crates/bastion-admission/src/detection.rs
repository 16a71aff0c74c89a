//! Pluggable connection classification.
//!
//! A [`DetectionEngine`] sees the registry record and the parsed handshake of
//! a connection and answers with a [`Verdict`]. The pipeline bounds every
//! call with a timeout and treats errors and panics as internal faults, so
//! engines only need to be correct, not defensive.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::config::HeuristicConfig;
use crate::handshake::Handshake;
use crate::registry::ConnectionRecord;
use crate::verdict::{ReasonCode, Verdict};

/// Errors a detection engine may return.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectionError {
    /// The engine cannot answer right now.
    #[error("detection engine unavailable: {0}")]
    Unavailable(String),

    /// The engine failed while classifying.
    #[error("detection engine failed: {0}")]
    Failed(String),
}

/// Classifies connections as legitimate or hostile.
#[async_trait]
pub trait DetectionEngine: Send + Sync {
    /// Classify a connection that passed handshake validation.
    async fn classify(
        &self,
        record: &ConnectionRecord,
        handshake: &Handshake,
    ) -> Result<Verdict, DetectionError>;

    /// Engine name for logs and audit records.
    fn name(&self) -> &'static str;
}

/// Engine that admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl DetectionEngine for AllowAll {
    async fn classify(
        &self,
        _record: &ConnectionRecord,
        _handshake: &Handshake,
    ) -> Result<Verdict, DetectionError> {
        Ok(Verdict::Allow)
    }

    fn name(&self) -> &'static str {
        "allow_all"
    }
}

/// Score and reasons produced by the heuristic detector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assessment {
    /// Combined score (0-100).
    pub score: u8,
    /// Signals that contributed to the score.
    pub reasons: Vec<&'static str>,
}

impl Assessment {
    fn add(&mut self, points: u8, reason: &'static str) {
        self.score = self.score.saturating_add(points).min(100);
        self.reasons.push(reason);
    }
}

/// Signal-based detector looking at handshake content and address history.
#[derive(Debug, Clone)]
pub struct HeuristicDetector {
    config: HeuristicConfig,
    expected_hosts: Vec<String>,
}

impl HeuristicDetector {
    /// Create a detector.
    #[must_use]
    pub fn new(config: HeuristicConfig) -> Self {
        let expected_hosts = config
            .expected_hosts
            .iter()
            .map(|h| h.trim_end_matches('.').to_ascii_lowercase())
            .collect();
        Self {
            config,
            expected_hosts,
        }
    }

    /// Score a connection without deciding on it.
    #[must_use]
    pub fn assess(&self, record: &ConnectionRecord, handshake: &Handshake) -> Assessment {
        let mut assessment = Assessment::default();
        let host = handshake.host();

        if host.is_empty() {
            assessment.add(40, "empty_server_address");
        } else if host.parse::<IpAddr>().is_ok() {
            assessment.add(25, "ip_literal_address");
        }

        if !self.expected_hosts.is_empty()
            && !self
                .expected_hosts
                .iter()
                .any(|expected| expected.eq_ignore_ascii_case(host))
        {
            assessment.add(40, "unexpected_host");
        }

        if self
            .config
            .expected_port
            .is_some_and(|port| port != handshake.server_port)
        {
            assessment.add(20, "unexpected_port");
        }

        if handshake.has_forwarding_markers() && !self.config.allow_forwarding_markers {
            assessment.add(50, "forwarding_markers");
        }

        if record.reputation >= f64::from(self.config.suspicious_reputation) {
            assessment.add(30, "poor_reputation");
        }

        if record.prior_connections >= self.config.churn_threshold {
            assessment.add(35, "reconnect_churn");
        }

        assessment
    }

    /// Map a score onto a verdict.
    #[must_use]
    pub const fn decide(&self, score: u8) -> Verdict {
        if score >= self.config.block_threshold {
            Verdict::reject(ReasonCode::ClassificationRejected)
        } else if score >= self.config.suspicion_threshold {
            Verdict::Throttle {
                reason: ReasonCode::ClassificationRejected,
                retry_after: Duration::ZERO,
            }
        } else {
            Verdict::Allow
        }
    }
}

impl Default for HeuristicDetector {
    fn default() -> Self {
        Self::new(HeuristicConfig::default())
    }
}

#[async_trait]
impl DetectionEngine for HeuristicDetector {
    async fn classify(
        &self,
        record: &ConnectionRecord,
        handshake: &Handshake,
    ) -> Result<Verdict, DetectionError> {
        let assessment = self.assess(record, handshake);
        let verdict = self.decide(assessment.score);
        if !verdict.is_allowed() {
            debug!(
                connection = %record.key,
                score = assessment.score,
                reasons = ?assessment.reasons,
                "Heuristic flagged connection"
            );
        }
        Ok(verdict)
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}

/// Runs several engines in order.
///
/// The first `Block` wins; otherwise the first `Throttle` is returned, and
/// `Allow` only if every engine allowed. Errors abort the chain.
#[derive(Clone, Default)]
pub struct DetectorChain {
    engines: Vec<Arc<dyn DetectionEngine>>,
}

impl DetectorChain {
    /// Create an empty chain, which allows everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an engine.
    #[must_use]
    pub fn with(mut self, engine: Arc<dyn DetectionEngine>) -> Self {
        self.engines.push(engine);
        self
    }

    /// Number of engines in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Check if the chain has no engines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

impl fmt::Debug for DetectorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.engines.iter().map(|e| e.name()))
            .finish()
    }
}

#[async_trait]
impl DetectionEngine for DetectorChain {
    async fn classify(
        &self,
        record: &ConnectionRecord,
        handshake: &Handshake,
    ) -> Result<Verdict, DetectionError> {
        let mut outcome = Verdict::Allow;
        for engine in &self.engines {
            match engine.classify(record, handshake).await? {
                block @ Verdict::Block { .. } => {
                    debug!(connection = %record.key, engine = engine.name(), "Chain blocked");
                    return Ok(block);
                }
                throttle @ Verdict::Throttle { .. } if outcome.is_allowed() => outcome = throttle,
                _ => {}
            }
        }
        Ok(outcome)
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::NextState;
    use crate::registry::{ConnectionKey, ConnectionState};
    use chrono::Utc;
    use test_case::test_case;

    fn record() -> ConnectionRecord {
        let now = Utc::now();
        ConnectionRecord {
            key: ConnectionKey {
                address: "203.0.113.7".parse().unwrap(),
                id: 1,
            },
            first_seen: now,
            last_seen: now,
            bytes_in: 0,
            packets_in: 0,
            reputation: 0.0,
            state: ConnectionState::HandshakeValidated,
            prior_connections: 0,
        }
    }

    fn login(address: &str, port: u16) -> Handshake {
        Handshake::new(765, address, port, NextState::Login)
    }

    fn strict() -> HeuristicDetector {
        HeuristicDetector::new(HeuristicConfig {
            expected_hosts: vec!["play.example.net".to_string()],
            expected_port: Some(25565),
            allow_forwarding_markers: false,
            ..HeuristicConfig::default()
        })
    }

    struct Fixed(Result<Verdict, DetectionError>);

    #[async_trait]
    impl DetectionEngine for Fixed {
        async fn classify(
            &self,
            _record: &ConnectionRecord,
            _handshake: &Handshake,
        ) -> Result<Verdict, DetectionError> {
            self.0.clone()
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    #[tokio::test]
    async fn test_allow_all() {
        let verdict = AllowAll
            .classify(&record(), &login("play.example.net", 25565))
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Allow);
    }

    #[test_case("play.example.net", 25565, 0 ; "expected host")]
    #[test_case("PLAY.example.net.", 25565, 0 ; "case and trailing dot")]
    #[test_case("other.example.net", 25565, 40 ; "unexpected host")]
    #[test_case("play.example.net", 25566, 20 ; "unexpected port")]
    #[test_case("198.51.100.4", 25565, 65 ; "ip literal is also unexpected")]
    #[test_case("play.example.net\0FML3\0", 25565, 50 ; "forwarding markers")]
    #[test_case("", 1, 100 ; "empty address with wrong port")]
    fn test_heuristic_scores(address: &str, port: u16, expected: u8) {
        let assessment = strict().assess(&record(), &login(address, port));
        assert_eq!(assessment.score, expected, "reasons: {:?}", assessment.reasons);
    }

    #[test]
    fn test_heuristic_history_signals() {
        let detector = HeuristicDetector::default();
        let handshake = login("play.example.net", 25565);

        let mut churny = record();
        churny.prior_connections = 50;
        churny.reputation = 80.0;
        let assessment = detector.assess(&churny, &handshake);
        assert_eq!(assessment.score, 65);
        assert_eq!(assessment.reasons, vec!["poor_reputation", "reconnect_churn"]);
    }

    #[test_case(0, Verdict::Allow ; "clean")]
    #[test_case(39, Verdict::Allow ; "below suspicion")]
    #[test_case(40, Verdict::Throttle { reason: ReasonCode::ClassificationRejected, retry_after: Duration::ZERO } ; "suspicious")]
    #[test_case(70, Verdict::reject(ReasonCode::ClassificationRejected) ; "hostile")]
    fn test_decide_thresholds(score: u8, expected: Verdict) {
        assert_eq!(HeuristicDetector::default().decide(score), expected);
    }

    #[tokio::test]
    async fn test_heuristic_blocks_hostile_handshake() {
        let verdict = strict()
            .classify(&record(), &login("10.1.1.1\0proxy", 1))
            .await
            .unwrap();
        assert!(verdict.is_blocked());
        assert_eq!(verdict.reason(), Some(ReasonCode::ClassificationRejected));
    }

    #[tokio::test]
    async fn test_chain_first_block_wins() {
        let throttle = Verdict::Throttle {
            reason: ReasonCode::ClassificationRejected,
            retry_after: Duration::ZERO,
        };
        let chain = DetectorChain::new()
            .with(Arc::new(AllowAll))
            .with(Arc::new(Fixed(Ok(throttle))))
            .with(Arc::new(Fixed(Ok(Verdict::reject(ReasonCode::ClassificationRejected)))))
            .with(Arc::new(Fixed(Err(DetectionError::Failed("unreachable".into())))));

        let verdict = chain
            .classify(&record(), &login("play.example.net", 25565))
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::reject(ReasonCode::ClassificationRejected));
        assert_eq!(chain.len(), 4);
    }

    #[tokio::test]
    async fn test_chain_throttle_and_errors() {
        let throttle = Verdict::Throttle {
            reason: ReasonCode::ClassificationRejected,
            retry_after: Duration::ZERO,
        };
        let handshake = login("play.example.net", 25565);

        let soft = DetectorChain::new()
            .with(Arc::new(Fixed(Ok(throttle))))
            .with(Arc::new(AllowAll));
        assert_eq!(soft.classify(&record(), &handshake).await.unwrap(), throttle);

        let failing = DetectorChain::new().with(Arc::new(Fixed(Err(
            DetectionError::Unavailable("backend down".into()),
        ))));
        assert!(failing.classify(&record(), &handshake).await.is_err());

        assert!(DetectorChain::new().is_empty());
        assert_eq!(
            DetectorChain::new().classify(&record(), &handshake).await.unwrap(),
            Verdict::Allow
        );
    }
}

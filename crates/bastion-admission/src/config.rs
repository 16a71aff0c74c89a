//! Admission configuration.
//!
//! Durations are stored as integer milliseconds so that configuration files
//! stay readable; each section exposes `Duration` accessors.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AdmissionError, AdmissionResult};
use crate::handshake::NextState;

/// Configuration for the connection registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum concurrent live connections per address.
    pub max_connections_per_address: u32,
    /// How long an address without live connections is remembered.
    pub recent_ttl_ms: u64,
}

impl RegistryConfig {
    /// Retention for recently-seen addresses.
    #[must_use]
    pub const fn recent_ttl(&self) -> Duration {
        Duration::from_millis(self.recent_ttl_ms)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections_per_address: 4,
            recent_ttl_ms: 10 * 60 * 1000,
        }
    }
}

/// Configuration for the sliding-window rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Maximum connection events allowed inside one window.
    pub max_events_per_window: u32,
    /// Number of buckets in the window.
    pub window_buckets: u32,
    /// Width of a single bucket.
    pub bucket_ms: u64,
    /// Throttle events inside the escalation window before a block.
    pub escalation_threshold: u32,
    /// Window over which throttle events are counted for escalation.
    pub escalation_window_ms: u64,
    /// Idle time after which a reputation entry is evicted.
    pub idle_ttl_ms: u64,
    /// Whether rate limiting is enabled.
    pub enabled: bool,
}

impl LimiterConfig {
    /// Width of a single bucket.
    #[must_use]
    pub const fn bucket_duration(&self) -> Duration {
        Duration::from_millis(self.bucket_ms)
    }

    /// Total width of the sliding window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.bucket_ms.saturating_mul(self.window_buckets as u64))
    }

    /// Escalation window.
    #[must_use]
    pub const fn escalation_window(&self) -> Duration {
        Duration::from_millis(self.escalation_window_ms)
    }

    /// Idle eviction TTL.
    #[must_use]
    pub const fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_events_per_window: 10,
            window_buckets: 10,
            bucket_ms: 100, // 1 second window
            escalation_threshold: 3,
            escalation_window_ms: 60_000,
            idle_ttl_ms: 60 * 60 * 1000,
            enabled: true,
        }
    }
}

/// Configuration for reputation scoring.
///
/// The score is an accumulated penalty: `baseline_score` is neutral standing
/// and larger values are worse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Neutral score new and recovered addresses sit at.
    pub baseline_score: f64,
    /// Score at which the address is blocked.
    pub block_score: f64,
    /// Points recovered per second of quiet.
    pub decay_per_second: f64,
    /// Penalty for each throttle.
    pub throttle_penalty: f64,
    /// Penalty for a malformed handshake.
    pub malformed_penalty: f64,
    /// Penalty for a hostile classification.
    pub classification_penalty: f64,
    /// Penalty for a soft (throttle) classification.
    pub suspicion_penalty: f64,
    /// Penalty for a classification timeout under fail-closed.
    pub timeout_penalty: f64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            baseline_score: 0.0,
            block_score: 100.0,
            decay_per_second: 1.0,
            throttle_penalty: 10.0,
            malformed_penalty: 25.0,
            classification_penalty: 50.0,
            suspicion_penalty: 15.0,
            timeout_penalty: 5.0,
        }
    }
}

/// Configuration for block durations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlocklistConfig {
    /// First escalation block duration.
    pub base_block_ms: u64,
    /// Cap for escalated and manual blocks.
    pub max_block_ms: u64,
}

impl BlocklistConfig {
    /// First escalation block duration.
    #[must_use]
    pub const fn base_block_duration(&self) -> Duration {
        Duration::from_millis(self.base_block_ms)
    }

    /// Block duration cap.
    #[must_use]
    pub const fn max_block_duration(&self) -> Duration {
        Duration::from_millis(self.max_block_ms)
    }
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            base_block_ms: 30_000,
            max_block_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// Configuration for handshake validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Byte budget for the handshake frame.
    pub max_bytes: usize,
    /// Time allowed to receive the full handshake.
    pub timeout_ms: u64,
    /// Lowest accepted protocol version.
    pub min_protocol_version: Option<i32>,
    /// Highest accepted protocol version.
    pub max_protocol_version: Option<i32>,
    /// Maximum server address length in bytes.
    pub max_address_len: usize,
    /// Next states a client may request.
    pub allowed_next_states: Vec<NextState>,
}

impl HandshakeConfig {
    /// Handshake receive timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_bytes: 512,
            timeout_ms: 5_000,
            min_protocol_version: None,
            max_protocol_version: None,
            max_address_len: 255,
            allowed_next_states: vec![NextState::Status, NextState::Login, NextState::Transfer],
        }
    }
}

/// What to do when the detection engine fails or times out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the connection and record degraded mode.
    #[default]
    FailOpen,
    /// Reject the connection.
    FailClosed,
}

/// Configuration for the built-in heuristic detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicConfig {
    /// Hostnames clients are expected to dial (empty = any).
    pub expected_hosts: Vec<String>,
    /// Port clients are expected to dial.
    pub expected_port: Option<u16>,
    /// Whether forwarding markers appended to the address are acceptable.
    pub allow_forwarding_markers: bool,
    /// Registrations in the registry's memory before churn is suspicious.
    pub churn_threshold: u64,
    /// Reputation penalty score above which a client is suspicious.
    pub suspicious_reputation: u32,
    /// Score (0-100) at which the detector blocks.
    pub block_threshold: u8,
    /// Score (0-100) at which the detector flags the connection.
    pub suspicion_threshold: u8,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            expected_hosts: Vec::new(),
            expected_port: None,
            allow_forwarding_markers: true,
            churn_threshold: 50,
            suspicious_reputation: 50,
            block_threshold: 70,
            suspicion_threshold: 40,
        }
    }
}

/// Configuration for the detection stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Maximum time the engine may take to classify.
    pub classify_timeout_ms: u64,
    /// Policy for timeouts and engine failures.
    pub failure_policy: FailurePolicy,
    /// Heuristic detector settings.
    pub heuristic: HeuristicConfig,
}

impl DetectionConfig {
    /// Classification timeout.
    #[must_use]
    pub const fn classify_timeout(&self) -> Duration {
        Duration::from_millis(self.classify_timeout_ms)
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            classify_timeout_ms: 250,
            failure_policy: FailurePolicy::FailOpen,
            heuristic: HeuristicConfig::default(),
        }
    }
}

/// Configuration for pipeline orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Cumulative throttle delay after which the connection is rejected.
    pub max_throttle_wait_ms: u64,
}

impl PipelineConfig {
    /// Maximum cumulative throttle delay.
    #[must_use]
    pub const fn max_throttle_wait(&self) -> Duration {
        Duration::from_millis(self.max_throttle_wait_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_throttle_wait_ms: 2_000,
        }
    }
}

/// Main admission configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldConfig {
    /// Connection registry settings.
    pub registry: RegistryConfig,
    /// Rate limiting settings.
    pub limiter: LimiterConfig,
    /// Reputation settings.
    pub reputation: ReputationConfig,
    /// Block duration settings.
    pub blocklist: BlocklistConfig,
    /// Handshake validation settings.
    pub handshake: HandshakeConfig,
    /// Detection settings.
    pub detection: DetectionConfig,
    /// Pipeline settings.
    pub pipeline: PipelineConfig,
}

impl ShieldConfig {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> ShieldConfigBuilder {
        ShieldConfigBuilder::default()
    }

    /// Parse configuration from a TOML string and validate it.
    pub fn from_toml(content: &str) -> AdmissionResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AdmissionError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> AdmissionResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AdmissionError::Config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> AdmissionResult<()> {
        let limiter = &self.limiter;
        if limiter.window_buckets == 0 || limiter.bucket_ms == 0 {
            return Err(AdmissionError::Config(
                "limiter window must have at least one non-empty bucket".to_string(),
            ));
        }
        if limiter.escalation_threshold == 0 {
            return Err(AdmissionError::Config(
                "limiter.escalation_threshold must be at least 1".to_string(),
            ));
        }

        let reputation = &self.reputation;
        if !reputation.decay_per_second.is_finite() || reputation.decay_per_second < 0.0 {
            return Err(AdmissionError::Config(
                "reputation.decay_per_second must be a non-negative number".to_string(),
            ));
        }
        if reputation.block_score <= reputation.baseline_score {
            return Err(AdmissionError::Config(
                "reputation.block_score must exceed reputation.baseline_score".to_string(),
            ));
        }

        if self.blocklist.base_block_ms == 0 {
            return Err(AdmissionError::Config(
                "blocklist.base_block_ms cannot be zero".to_string(),
            ));
        }
        if self.blocklist.max_block_ms < self.blocklist.base_block_ms {
            return Err(AdmissionError::Config(
                "blocklist.max_block_ms must be at least blocklist.base_block_ms".to_string(),
            ));
        }

        let handshake = &self.handshake;
        if handshake.max_bytes < 3 {
            return Err(AdmissionError::Config(
                "handshake.max_bytes is too small to hold a handshake".to_string(),
            ));
        }
        if handshake.timeout_ms == 0 {
            return Err(AdmissionError::Config(
                "handshake.timeout_ms cannot be zero".to_string(),
            ));
        }
        if let (Some(min), Some(max)) =
            (handshake.min_protocol_version, handshake.max_protocol_version)
        {
            if min > max {
                return Err(AdmissionError::Config(format!(
                    "handshake protocol range is inverted: {min} > {max}"
                )));
            }
        }
        if handshake.allowed_next_states.is_empty() {
            return Err(AdmissionError::Config(
                "handshake.allowed_next_states cannot be empty".to_string(),
            ));
        }

        let heuristic = &self.detection.heuristic;
        if heuristic.block_threshold > 100 || heuristic.suspicion_threshold > heuristic.block_threshold {
            return Err(AdmissionError::Config(
                "detection.heuristic thresholds must satisfy suspicion <= block <= 100".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for `ShieldConfig`.
#[derive(Debug, Clone, Default)]
pub struct ShieldConfigBuilder {
    config: ShieldConfig,
}

impl ShieldConfigBuilder {
    /// Set registry configuration.
    #[must_use]
    pub fn registry(mut self, config: RegistryConfig) -> Self {
        self.config.registry = config;
        self
    }

    /// Set limiter configuration.
    #[must_use]
    pub fn limiter(mut self, config: LimiterConfig) -> Self {
        self.config.limiter = config;
        self
    }

    /// Set reputation configuration.
    #[must_use]
    pub fn reputation(mut self, config: ReputationConfig) -> Self {
        self.config.reputation = config;
        self
    }

    /// Set blocklist configuration.
    #[must_use]
    pub fn blocklist(mut self, config: BlocklistConfig) -> Self {
        self.config.blocklist = config;
        self
    }

    /// Set handshake configuration.
    #[must_use]
    pub fn handshake(mut self, config: HandshakeConfig) -> Self {
        self.config.handshake = config;
        self
    }

    /// Set detection configuration.
    #[must_use]
    pub fn detection(mut self, config: DetectionConfig) -> Self {
        self.config.detection = config;
        self
    }

    /// Set the failure policy.
    #[must_use]
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.detection.failure_policy = policy;
        self
    }

    /// Set pipeline configuration.
    #[must_use]
    pub fn pipeline(mut self, config: PipelineConfig) -> Self {
        self.config.pipeline = config;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> ShieldConfig {
        self.config
    }
}

//! Rate and reputation limiting.
//!
//! Every address gets a [`ReputationEntry`]: a bucketed sliding window of
//! connection events, a list of recent throttle events, and a penalty score
//! that decays linearly toward the neutral baseline. Nothing runs in the
//! background; windows roll and scores decay when the entry is next touched.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::blocklist::Blocklist;
use crate::config::{BlocklistConfig, LimiterConfig, ReputationConfig};
use crate::verdict::{ReasonCode, Verdict};

/// Fixed ring of event counters, one per bucket.
#[derive(Debug)]
struct BucketWindow {
    counts: Box<[u32]>,
    width: Duration,
    origin: Instant,
    /// Absolute index of the newest bucket.
    head: u64,
}

impl BucketWindow {
    fn new(buckets: u32, width: Duration, origin: Instant) -> Self {
        Self {
            counts: vec![0; buckets.max(1) as usize].into_boxed_slice(),
            width,
            origin,
            head: 0,
        }
    }

    fn len(&self) -> u64 {
        self.counts.len() as u64
    }

    fn slot(&self, abs: u64) -> usize {
        (abs % self.len()) as usize
    }

    fn bucket_of(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        let width = self.width.as_nanos().max(1);
        u64::try_from(elapsed / width).unwrap_or(u64::MAX)
    }

    fn bucket_start(&self, abs: u64) -> Option<Instant> {
        let nanos = self.width.as_nanos().saturating_mul(u128::from(abs));
        let offset = Duration::from_nanos(u64::try_from(nanos).ok()?);
        self.origin.checked_add(offset)
    }

    /// Roll the window forward, zeroing buckets that fell out.
    fn advance(&mut self, now: Instant) {
        let abs = self.bucket_of(now);
        if abs <= self.head {
            return;
        }
        let stale = (abs - self.head).min(self.len());
        for step in 1..=stale {
            let slot = self.slot(self.head + step);
            self.counts[slot] = 0;
        }
        self.head = abs;
    }

    fn record(&mut self) {
        let slot = self.slot(self.head);
        self.counts[slot] = self.counts[slot].saturating_add(1);
    }

    fn total(&self) -> u32 {
        self.counts.iter().fold(0u32, |acc, c| acc.saturating_add(*c))
    }

    /// Events still inside the window as of `now`, without rolling it.
    fn total_at(&self, now: Instant) -> u32 {
        let newest = self.bucket_of(now).max(self.head);
        let oldest = (newest + 1).saturating_sub(self.len());
        (oldest..=self.head).fold(0u32, |acc, abs| acc.saturating_add(self.counts[self.slot(abs)]))
    }

    /// Time until enough old buckets roll out for one more event to fit.
    fn retry_after(&self, max_events: u32, now: Instant) -> Duration {
        let n = self.len();
        let mut remaining = self.total();
        let oldest = (self.head + 1).saturating_sub(n);

        for abs in oldest..=self.head {
            remaining = remaining.saturating_sub(self.counts[self.slot(abs)]);
            if remaining < max_events {
                return self
                    .bucket_start(abs + n)
                    .map_or(self.width, |frees_at| frees_at.saturating_duration_since(now));
            }
        }
        self.width.saturating_mul(u32::try_from(n).unwrap_or(u32::MAX))
    }
}

#[derive(Debug)]
struct AddressState {
    window: BucketWindow,
    throttles: VecDeque<Instant>,
    score: f64,
    scored_at: Instant,
    escalation_level: u32,
    total_throttles: u64,
    first_seen: DateTime<Utc>,
    last_seen: Instant,
}

impl AddressState {
    fn new(config: &LimiterConfig, baseline: f64, now: Instant) -> Self {
        Self {
            window: BucketWindow::new(config.window_buckets, config.bucket_duration(), now),
            throttles: VecDeque::new(),
            score: baseline,
            scored_at: now,
            escalation_level: 0,
            total_throttles: 0,
            first_seen: Utc::now(),
            last_seen: now,
        }
    }
}

/// Snapshot of an address's limiter state.
#[derive(Debug, Clone, PartialEq)]
pub struct ReputationEntry {
    /// Address the entry belongs to.
    pub address: IpAddr,
    /// Decayed penalty score.
    pub score: f64,
    /// Events currently inside the sliding window.
    pub events_in_window: u32,
    /// Throttle events inside the escalation window.
    pub recent_throttles: u32,
    /// Throttle events over the entry's lifetime.
    pub total_throttles: u64,
    /// Number of escalations to a block so far.
    pub escalation_level: u32,
    /// When the address was first seen.
    pub first_seen: DateTime<Utc>,
}

/// Linear decay of `score` toward `baseline` over `elapsed`.
fn decayed(score: f64, baseline: f64, per_second: f64, elapsed: Duration) -> f64 {
    (score - per_second * elapsed.as_secs_f64()).max(baseline)
}

/// Per-address rate limiter with decaying reputation and escalating blocks.
#[derive(Debug)]
pub struct ReputationLimiter {
    config: LimiterConfig,
    reputation: ReputationConfig,
    base_block: Duration,
    blocklist: Arc<Blocklist>,
    states: DashMap<IpAddr, AddressState>,
}

impl ReputationLimiter {
    /// Create a limiter writing escalated blocks into `blocklist`.
    #[must_use]
    pub fn new(
        config: LimiterConfig,
        reputation: ReputationConfig,
        blocks: &BlocklistConfig,
        blocklist: Arc<Blocklist>,
    ) -> Self {
        Self {
            config,
            reputation,
            base_block: blocks.base_block_duration(),
            blocklist,
            states: DashMap::new(),
        }
    }

    /// Record a connection event for `address` and decide on it.
    pub fn check(&self, address: &IpAddr) -> Verdict {
        self.check_at(address, Instant::now())
    }

    /// Record a connection event as of `now`.
    pub fn check_at(&self, address: &IpAddr, now: Instant) -> Verdict {
        if let Some(block) = self.blocklist.status_at(address, now) {
            return Verdict::Block {
                reason: ReasonCode::ReputationBlocked,
                duration: block.remaining,
            };
        }
        if !self.config.enabled {
            return Verdict::Allow;
        }

        let mut state = self
            .states
            .entry(*address)
            .or_insert_with(|| AddressState::new(&self.config, self.reputation.baseline_score, now));
        self.refresh(&mut state, now);

        if state.score >= self.reputation.block_score {
            return self.escalate(address, &mut state, ReasonCode::ReputationBlocked, now);
        }

        if state.window.total() < self.config.max_events_per_window {
            state.window.record();
            return Verdict::Allow;
        }

        state.throttles.push_back(now);
        state.total_throttles = state.total_throttles.saturating_add(1);
        state.score += self.reputation.throttle_penalty;

        if state.throttles.len() >= self.config.escalation_threshold as usize {
            return self.escalate(address, &mut state, ReasonCode::RateExceeded, now);
        }
        if state.score >= self.reputation.block_score {
            return self.escalate(address, &mut state, ReasonCode::ReputationBlocked, now);
        }

        let retry_after = state
            .window
            .retry_after(self.config.max_events_per_window, now);
        debug!(
            ip = %address,
            throttles = state.throttles.len(),
            retry_after_ms = retry_after.as_millis() as u64,
            "Connection rate exceeded"
        );
        Verdict::Throttle {
            reason: ReasonCode::RateExceeded,
            retry_after,
        }
    }

    /// Penalty configured for a rejection reason.
    #[must_use]
    pub fn penalty_for(&self, reason: ReasonCode) -> f64 {
        let rep = &self.reputation;
        match reason {
            ReasonCode::MalformedHandshake => rep.malformed_penalty,
            ReasonCode::ClassificationRejected => rep.classification_penalty,
            ReasonCode::ClassificationTimeout => rep.timeout_penalty,
            ReasonCode::RateExceeded | ReasonCode::ConnectionLimit => rep.throttle_penalty,
            ReasonCode::ReputationBlocked | ReasonCode::InternalFault | ReasonCode::ManualBlock => {
                0.0
            }
        }
    }

    /// Penalize `address` for a rejection in a later stage.
    ///
    /// Returns the block verdict if the penalty pushed the score over the
    /// block threshold.
    pub fn penalize(&self, address: &IpAddr, reason: ReasonCode) -> Option<Verdict> {
        self.penalize_by(address, self.penalty_for(reason))
    }

    /// Add `amount` to the score of `address`.
    pub fn penalize_by(&self, address: &IpAddr, amount: f64) -> Option<Verdict> {
        self.penalize_at(address, amount, Instant::now())
    }

    /// Add `amount` to the score of `address` as of `now`.
    pub fn penalize_at(&self, address: &IpAddr, amount: f64, now: Instant) -> Option<Verdict> {
        if amount <= 0.0 || !amount.is_finite() {
            return None;
        }

        let mut state = self
            .states
            .entry(*address)
            .or_insert_with(|| AddressState::new(&self.config, self.reputation.baseline_score, now));
        self.refresh(&mut state, now);
        state.score += amount;
        debug!(ip = %address, amount, score = state.score, "Reputation penalty");

        if state.score >= self.reputation.block_score && !self.blocklist.is_blocked_at(address, now) {
            return Some(self.escalate(address, &mut state, ReasonCode::ReputationBlocked, now));
        }
        None
    }

    /// Current decayed score, if the address is tracked.
    #[must_use]
    pub fn score(&self, address: &IpAddr) -> Option<f64> {
        self.score_at(address, Instant::now())
    }

    /// Decayed score as of `now`.
    #[must_use]
    pub fn score_at(&self, address: &IpAddr, now: Instant) -> Option<f64> {
        let state = self.states.get(address)?;
        Some(decayed(
            state.score,
            self.reputation.baseline_score,
            self.reputation.decay_per_second,
            now.saturating_duration_since(state.scored_at),
        ))
    }

    /// Snapshot of an address's entry. Does not count as activity.
    #[must_use]
    pub fn entry(&self, address: &IpAddr) -> Option<ReputationEntry> {
        self.entry_at(address, Instant::now())
    }

    /// Snapshot of an address's entry as of `now`.
    #[must_use]
    pub fn entry_at(&self, address: &IpAddr, now: Instant) -> Option<ReputationEntry> {
        let state = self.states.get(address)?;
        let horizon = self.config.escalation_window();
        let recent_throttles = state
            .throttles
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < horizon)
            .count();
        Some(ReputationEntry {
            address: *address,
            score: decayed(
                state.score,
                self.reputation.baseline_score,
                self.reputation.decay_per_second,
                now.saturating_duration_since(state.scored_at),
            ),
            events_in_window: state.window.total_at(now),
            recent_throttles: recent_throttles as u32,
            total_throttles: state.total_throttles,
            escalation_level: state.escalation_level,
            first_seen: state.first_seen,
        })
    }

    /// Number of tracked addresses.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.states.len()
    }

    /// Forget everything about an address. Blocks are left in place.
    pub fn reset(&self, address: &IpAddr) -> bool {
        self.states.remove(address).is_some()
    }

    /// Evict entries idle for longer than the configured TTL.
    ///
    /// Blocked addresses are kept so their escalation level survives the
    /// block; their idle time starts counting once the block is gone.
    pub fn purge_idle(&self, now: Instant) -> usize {
        let ttl = self.config.idle_ttl();
        let before = self.states.len();
        self.states.retain(|address, state| {
            if self.blocklist.is_blocked_at(address, now) {
                state.last_seen = state.last_seen.max(now);
                return true;
            }
            now.saturating_duration_since(state.last_seen) < ttl
        });
        let removed = before.saturating_sub(self.states.len());
        if removed > 0 {
            debug!(removed, "Evicted idle reputation entries");
        }
        removed
    }

    /// Shared blocklist.
    #[must_use]
    pub fn blocklist(&self) -> &Arc<Blocklist> {
        &self.blocklist
    }

    fn refresh(&self, state: &mut AddressState, now: Instant) {
        state.score = decayed(
            state.score,
            self.reputation.baseline_score,
            self.reputation.decay_per_second,
            now.saturating_duration_since(state.scored_at),
        );
        state.scored_at = state.scored_at.max(now);
        state.last_seen = state.last_seen.max(now);
        state.window.advance(now);

        let horizon = self.config.escalation_window();
        while state
            .throttles
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= horizon)
        {
            state.throttles.pop_front();
        }
    }

    fn escalate(
        &self,
        address: &IpAddr,
        state: &mut AddressState,
        reason: ReasonCode,
        now: Instant,
    ) -> Verdict {
        state.escalation_level = state.escalation_level.saturating_add(1);
        state.throttles.clear();

        let factor = 1u32
            .checked_shl(state.escalation_level - 1)
            .unwrap_or(u32::MAX);
        let requested = self.base_block.saturating_mul(factor);
        let duration = self.blocklist.block_at(address, reason, Some(requested), now);

        warn!(
            ip = %address,
            reason = %reason,
            level = state.escalation_level,
            duration_ms = duration.map(|d| d.as_millis() as u64),
            "Escalated to block"
        );
        Verdict::Block { reason, duration }
    }
}

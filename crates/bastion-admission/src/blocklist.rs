//! Address blocklist with expiry checked on access.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::BlocklistConfig;
use crate::verdict::ReasonCode;

/// Snapshot of an active block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStatus {
    /// Why the address is blocked.
    pub reason: ReasonCode,
    /// Wall-clock time the block was (last) placed.
    pub created_at: DateTime<Utc>,
    /// Time left on the block (`None` = permanent).
    pub remaining: Option<Duration>,
    /// Number of times this address has been blocked while listed.
    pub block_count: u32,
}

impl BlockStatus {
    /// Check if this block is permanent.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.remaining.is_none()
    }
}

#[derive(Debug)]
struct BlockEntry {
    reason: ReasonCode,
    created_at: DateTime<Utc>,
    expires: Option<Instant>,
    block_count: u32,
}

impl BlockEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|exp| now >= exp)
    }

    fn status(&self, now: Instant) -> BlockStatus {
        BlockStatus {
            reason: self.reason,
            created_at: self.created_at,
            remaining: self.expires.map(|exp| exp.saturating_duration_since(now)),
            block_count: self.block_count,
        }
    }
}

/// Blocklist shared by the registry and the limiter.
#[derive(Debug)]
pub struct Blocklist {
    blocked: DashMap<IpAddr, BlockEntry>,
    max_duration: Duration,
}

impl Blocklist {
    /// Create a blocklist capping durations at `max_duration`.
    #[must_use]
    pub fn new(max_duration: Duration) -> Self {
        Self {
            blocked: DashMap::new(),
            max_duration,
        }
    }

    /// Create from configuration.
    #[must_use]
    pub fn from_config(config: &BlocklistConfig) -> Self {
        Self::new(config.max_block_duration())
    }

    /// Block an address. `None` blocks permanently.
    ///
    /// Returns the effective duration after capping.
    pub fn block(&self, ip: &IpAddr, reason: ReasonCode, duration: Option<Duration>) -> Option<Duration> {
        self.block_at(ip, reason, duration, Instant::now())
    }

    /// Block an address as of `now`.
    pub fn block_at(
        &self,
        ip: &IpAddr,
        reason: ReasonCode,
        duration: Option<Duration>,
        now: Instant,
    ) -> Option<Duration> {
        let duration = duration.map(|d| d.min(self.max_duration));
        let expires = duration.map(|d| now + d);

        let mut entry = self.blocked.entry(*ip).or_insert_with(|| BlockEntry {
            reason,
            created_at: Utc::now(),
            expires,
            block_count: 0,
        });
        entry.reason = reason;
        entry.created_at = Utc::now();
        entry.expires = expires;
        entry.block_count = entry.block_count.saturating_add(1);

        info!(
            ip = %ip,
            reason = %reason,
            duration_ms = duration.map(|d| d.as_millis() as u64),
            block_count = entry.block_count,
            "Address blocked"
        );

        duration
    }

    /// Block an address permanently.
    pub fn block_permanent(&self, ip: &IpAddr, reason: ReasonCode) {
        self.block(ip, reason, None);
    }

    /// Remove a block. Returns whether a block existed.
    pub fn unblock(&self, ip: &IpAddr) -> bool {
        let removed = self.blocked.remove(ip).is_some();
        if removed {
            info!(ip = %ip, "Address unblocked");
        }
        removed
    }

    /// Current block on an address, if any.
    #[must_use]
    pub fn status(&self, ip: &IpAddr) -> Option<BlockStatus> {
        self.status_at(ip, Instant::now())
    }

    /// Current block on an address as of `now`. Expired entries are removed.
    #[must_use]
    pub fn status_at(&self, ip: &IpAddr, now: Instant) -> Option<BlockStatus> {
        let expired = {
            let entry = self.blocked.get(ip)?;
            if !entry.is_expired(now) {
                return Some(entry.status(now));
            }
            true
        };

        if expired && self.blocked.remove_if(ip, |_, e| e.is_expired(now)).is_some() {
            debug!(ip = %ip, "Block expired");
        }
        None
    }

    /// Check if an address is blocked.
    #[must_use]
    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        self.status(ip).is_some()
    }

    /// Check if an address is blocked as of `now`.
    #[must_use]
    pub fn is_blocked_at(&self, ip: &IpAddr, now: Instant) -> bool {
        self.status_at(ip, now).is_some()
    }

    /// Drop all expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    /// Drop entries expired as of `now`.
    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.blocked.len();
        self.blocked.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.blocked.len());
        if removed > 0 {
            debug!(removed, "Purged expired blocks");
        }
        removed
    }

    /// Number of entries, including ones that expired but were not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    /// Check if the blocklist is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }

    /// Remove every block.
    pub fn clear(&self) {
        self.blocked.clear();
    }

    /// Block duration cap.
    #[must_use]
    pub const fn max_duration(&self) -> Duration {
        self.max_duration
    }
}

impl Default for Blocklist {
    fn default() -> Self {
        Self::from_config(&BlocklistConfig::default())
    }
}

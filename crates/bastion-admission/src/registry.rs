//! Connection registry.
//!
//! Tracks live connections and recently-seen addresses. Each address owns one
//! slot in a sharded map; registration, updates, and release for an address
//! are serialized through that slot's entry lock, so two connections from the
//! same address can never race each other into duplicate records while
//! different addresses proceed independently.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::blocklist::Blocklist;
use crate::config::RegistryConfig;
use crate::error::{AdmissionError, AdmissionResult};

/// Admission state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Accepted by the listener, nothing checked yet.
    New,
    /// Holds a registry record.
    Registered,
    /// Sent a valid handshake.
    HandshakeValidated,
    /// Detection engine has answered.
    Classified,
    /// Traffic is being forwarded to the backend.
    Admitted,
    /// Closed by the firewall.
    Rejected,
}

impl ConnectionState {
    /// Check if no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Admitted | Self::Rejected)
    }

    /// Check if `next` is a legal successor of this state.
    ///
    /// Progress is strictly forward through the fixed stage order; `Rejected`
    /// is reachable from every non-terminal state.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Registered)
                | (Self::Registered, Self::HandshakeValidated)
                | (Self::HandshakeValidated, Self::Classified)
                | (Self::Classified, Self::Admitted)
                | (
                    Self::New | Self::Registered | Self::HandshakeValidated | Self::Classified,
                    Self::Rejected
                )
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Registered => "registered",
            Self::HandshakeValidated => "handshake_validated",
            Self::Classified => "classified",
            Self::Admitted => "admitted",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Identifies one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Peer address.
    pub address: IpAddr,
    /// Registry-unique connection id.
    pub id: u64,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.id)
    }
}

/// Snapshot of a live connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    /// Connection identity.
    pub key: ConnectionKey,
    /// When the connection was registered.
    pub first_seen: DateTime<Utc>,
    /// Last time traffic was recorded.
    pub last_seen: DateTime<Utc>,
    /// Bytes received from the peer.
    pub bytes_in: u64,
    /// Reads received from the peer.
    pub packets_in: u64,
    /// Reputation score of the address when last sampled.
    pub reputation: f64,
    /// Current admission state.
    pub state: ConnectionState,
    /// Registrations from this address the registry remembers before this one.
    pub prior_connections: u64,
}

impl ConnectionRecord {
    fn new(key: ConnectionKey, prior_connections: u64) -> Self {
        let now = Utc::now();
        Self {
            key,
            first_seen: now,
            last_seen: now,
            bytes_in: 0,
            packets_in: 0,
            reputation: 0.0,
            state: ConnectionState::Registered,
            prior_connections,
        }
    }

    /// Peer address.
    #[must_use]
    pub const fn address(&self) -> IpAddr {
        self.key.address
    }
}

#[derive(Debug)]
struct AddressSlot {
    live: Vec<ConnectionRecord>,
    registrations: u64,
    last_activity: Instant,
}

impl AddressSlot {
    const fn new(now: Instant) -> Self {
        Self {
            live: Vec::new(),
            registrations: 0,
            last_activity: now,
        }
    }

    fn find_mut(&mut self, id: u64) -> Option<&mut ConnectionRecord> {
        self.live.iter_mut().find(|r| r.key.id == id)
    }
}

/// Registry of live and recently-seen connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    slots: DashMap<IpAddr, AddressSlot>,
    blocklist: Arc<Blocklist>,
    max_per_address: u32,
    recent_ttl: std::time::Duration,
    next_id: AtomicU64,
    live: AtomicU64,
}

impl ConnectionRegistry {
    /// Create a registry consulting `blocklist` on registration.
    #[must_use]
    pub fn new(config: &RegistryConfig, blocklist: Arc<Blocklist>) -> Self {
        Self {
            slots: DashMap::new(),
            blocklist,
            max_per_address: config.max_connections_per_address,
            recent_ttl: config.recent_ttl(),
            next_id: AtomicU64::new(1),
            live: AtomicU64::new(0),
        }
    }

    /// Register a new connection from `address`.
    ///
    /// Blocked addresses fail immediately without a record being allocated.
    /// The returned lease releases the record when dropped.
    pub fn register(self: &Arc<Self>, address: IpAddr) -> AdmissionResult<ConnectionLease> {
        self.register_at(address, Instant::now())
    }

    /// Register as of `now`.
    pub fn register_at(
        self: &Arc<Self>,
        address: IpAddr,
        now: Instant,
    ) -> AdmissionResult<ConnectionLease> {
        self.ensure_not_blocked(address, now)?;

        let mut slot = self
            .slots
            .entry(address)
            .or_insert_with(|| AddressSlot::new(now));

        // A block may have landed while we waited for the entry.
        self.ensure_not_blocked(address, now)?;

        let current = slot.live.len() as u32;
        if current >= self.max_per_address {
            return Err(AdmissionError::ConnectionLimit {
                address,
                current,
                max: self.max_per_address,
            });
        }

        let key = ConnectionKey {
            address,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        let prior = slot.registrations;
        slot.registrations = slot.registrations.saturating_add(1);
        slot.last_activity = now;
        slot.live.push(ConnectionRecord::new(key, prior));
        drop(slot);

        self.live.fetch_add(1, Ordering::Relaxed);
        debug!(connection = %key, prior_connections = prior, "Connection registered");

        Ok(ConnectionLease {
            registry: Arc::clone(self),
            key,
        })
    }

    fn ensure_not_blocked(&self, address: IpAddr, now: Instant) -> AdmissionResult<()> {
        match self.blocklist.status_at(&address, now) {
            Some(block) => {
                debug!(ip = %address, reason = %block.reason, "Registration refused: blocked");
                Err(AdmissionError::Blocked {
                    address,
                    reason: block.reason,
                })
            }
            None => Ok(()),
        }
    }

    /// Record `bytes_in` received on a connection.
    ///
    /// Returns `false` if the connection is not live.
    pub fn update(&self, key: &ConnectionKey, bytes_in: u64) -> bool {
        let Some(mut slot) = self.slots.get_mut(&key.address) else {
            return false;
        };
        let Some(record) = slot.find_mut(key.id) else {
            return false;
        };
        record.bytes_in = record.bytes_in.saturating_add(bytes_in);
        record.packets_in = record.packets_in.saturating_add(1);
        record.last_seen = Utc::now();
        slot.last_activity = Instant::now();
        true
    }

    /// Move a connection to `state`.
    ///
    /// Returns `false` if the connection is not live or the transition is not
    /// allowed.
    pub fn set_state(&self, key: &ConnectionKey, state: ConnectionState) -> bool {
        let Some(mut slot) = self.slots.get_mut(&key.address) else {
            return false;
        };
        let Some(record) = slot.find_mut(key.id) else {
            return false;
        };
        if !record.state.can_transition_to(state) {
            debug!(connection = %key, from = %record.state, to = %state, "Illegal state transition ignored");
            return false;
        }
        trace!(connection = %key, from = %record.state, to = %state, "State transition");
        record.state = state;
        true
    }

    /// Store the latest reputation score sample on a connection.
    pub fn set_reputation(&self, key: &ConnectionKey, score: f64) -> bool {
        let Some(mut slot) = self.slots.get_mut(&key.address) else {
            return false;
        };
        let Some(record) = slot.find_mut(key.id) else {
            return false;
        };
        record.reputation = score;
        true
    }

    /// Release a connection's record.
    ///
    /// Idempotent: returns `true` only for the call that removed the record.
    pub fn release(&self, key: &ConnectionKey) -> bool {
        let Some(mut slot) = self.slots.get_mut(&key.address) else {
            return false;
        };
        let Some(pos) = slot.live.iter().position(|r| r.key.id == key.id) else {
            return false;
        };
        slot.live.swap_remove(pos);
        slot.last_activity = Instant::now();
        drop(slot);

        self.live.fetch_sub(1, Ordering::Relaxed);
        debug!(connection = %key, "Connection released");
        true
    }

    /// Snapshot of a live connection.
    #[must_use]
    pub fn record(&self, key: &ConnectionKey) -> Option<ConnectionRecord> {
        self.slots
            .get(&key.address)?
            .live
            .iter()
            .find(|r| r.key.id == key.id)
            .cloned()
    }

    /// Live connections from `address`.
    #[must_use]
    pub fn active_for(&self, address: &IpAddr) -> usize {
        self.slots.get(address).map_or(0, |slot| slot.live.len())
    }

    /// Registrations from `address` the registry still remembers.
    #[must_use]
    pub fn registrations(&self, address: &IpAddr) -> u64 {
        self.slots.get(address).map_or(0, |slot| slot.registrations)
    }

    /// Total live connections.
    #[must_use]
    pub fn active_connections(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    /// Addresses with live connections or recent activity.
    #[must_use]
    pub fn tracked_addresses(&self) -> usize {
        self.slots.len()
    }

    /// Forget idle addresses whose last activity is older than the retention.
    pub fn purge_stale(&self) -> usize {
        self.purge_stale_at(Instant::now())
    }

    /// Forget idle addresses as of `now`.
    pub fn purge_stale_at(&self, now: Instant) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            !slot.live.is_empty()
                || now.saturating_duration_since(slot.last_activity) < self.recent_ttl
        });
        before.saturating_sub(self.slots.len())
    }
}

/// Scoped ownership of a registry record.
///
/// Dropping the lease releases the record, so every exit path of the
/// connection's task releases exactly once.
#[derive(Debug)]
pub struct ConnectionLease {
    registry: Arc<ConnectionRegistry>,
    key: ConnectionKey,
}

impl ConnectionLease {
    /// Connection identity.
    #[must_use]
    pub const fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Peer address.
    #[must_use]
    pub const fn address(&self) -> IpAddr {
        self.key.address
    }

    /// Current snapshot of the record.
    #[must_use]
    pub fn record(&self) -> Option<ConnectionRecord> {
        self.registry.record(&self.key)
    }

    /// Record received bytes.
    pub fn update(&self, bytes_in: u64) -> bool {
        self.registry.update(&self.key, bytes_in)
    }

    /// Move the connection to `state`.
    pub fn set_state(&self, state: ConnectionState) -> bool {
        self.registry.set_state(&self.key, state)
    }

    /// Release now instead of at drop.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::ReasonCode;
    use std::sync::Barrier;
    use std::time::Duration;

    fn registry(max_per_address: u32) -> (Arc<ConnectionRegistry>, Arc<Blocklist>) {
        let blocklist = Arc::new(Blocklist::default());
        let config = RegistryConfig {
            max_connections_per_address: max_per_address,
            recent_ttl_ms: 60_000,
        };
        (
            Arc::new(ConnectionRegistry::new(&config, Arc::clone(&blocklist))),
            blocklist,
        )
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_state_transitions() {
        use ConnectionState::*;

        assert!(New.can_transition_to(Registered));
        assert!(Registered.can_transition_to(HandshakeValidated));
        assert!(HandshakeValidated.can_transition_to(Classified));
        assert!(Classified.can_transition_to(Admitted));
        for state in [New, Registered, HandshakeValidated, Classified] {
            assert!(state.can_transition_to(Rejected), "{state} -> rejected");
        }

        // No skipping stages, no leaving terminal states.
        assert!(!Registered.can_transition_to(Classified));
        assert!(!Registered.can_transition_to(Admitted));
        assert!(!Admitted.can_transition_to(Rejected));
        assert!(!Rejected.can_transition_to(Registered));
        assert!(Admitted.is_terminal());
        assert!(Rejected.is_terminal());
    }

    #[test]
    fn test_register_and_release() {
        let (registry, _) = registry(4);
        let addr = ip("10.0.0.1");

        let lease = registry.register(addr).unwrap();
        assert_eq!(registry.active_for(&addr), 1);
        assert_eq!(registry.active_connections(), 1);

        let record = lease.record().unwrap();
        assert_eq!(record.address(), addr);
        assert_eq!(record.state, ConnectionState::Registered);
        assert_eq!(record.prior_connections, 0);

        drop(lease);
        assert_eq!(registry.active_for(&addr), 0);
        assert_eq!(registry.active_connections(), 0);
        // Still remembered as recently seen.
        assert_eq!(registry.tracked_addresses(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let (registry, _) = registry(4);
        let addr = ip("10.0.0.1");
        let other = registry.register(addr).unwrap();
        let lease = registry.register(addr).unwrap();
        let key = *lease.key();

        assert!(registry.release(&key));
        assert!(!registry.release(&key));
        // Dropping the lease after a manual release is also a no-op.
        drop(lease);

        assert_eq!(registry.active_for(&addr), 1);
        assert_eq!(registry.active_connections(), 1);
        assert!(other.record().is_some());
    }

    #[test]
    fn test_blocked_address_is_refused_without_record() {
        let (registry, blocklist) = registry(4);
        let addr = ip("10.0.0.2");
        blocklist.block(&addr, ReasonCode::RateExceeded, Some(Duration::from_secs(60)));

        let err = registry.register(addr).unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::Blocked {
                reason: ReasonCode::RateExceeded,
                ..
            }
        ));
        assert_eq!(registry.tracked_addresses(), 0);
        assert_eq!(registry.active_connections(), 0);
    }

    #[test]
    fn test_per_address_limit() {
        let (registry, _) = registry(2);
        let addr = ip("10.0.0.3");

        let _a = registry.register(addr).unwrap();
        let _b = registry.register(addr).unwrap();
        let err = registry.register(addr).unwrap_err();
        assert!(matches!(err, AdmissionError::ConnectionLimit { current: 2, max: 2, .. }));

        // Other addresses are unaffected.
        assert!(registry.register(ip("10.0.0.4")).is_ok());
    }

    #[test]
    fn test_prior_connections_counts_history() {
        let (registry, _) = registry(1);
        let addr = ip("10.0.0.5");

        for expected in 0..3 {
            let lease = registry.register(addr).unwrap();
            assert_eq!(lease.record().unwrap().prior_connections, expected);
        }
        assert_eq!(registry.registrations(&addr), 3);
    }

    #[test]
    fn test_update_counters() {
        let (registry, _) = registry(4);
        let lease = registry.register(ip("10.0.0.6")).unwrap();

        assert!(lease.update(100));
        assert!(lease.update(20));

        let record = lease.record().unwrap();
        assert_eq!(record.bytes_in, 120);
        assert_eq!(record.packets_in, 2);
        assert!(record.last_seen >= record.first_seen);

        let key = *lease.key();
        drop(lease);
        assert!(!registry.update(&key, 1));
    }

    #[test]
    fn test_set_state_enforces_order() {
        let (registry, _) = registry(4);
        let lease = registry.register(ip("10.0.0.7")).unwrap();

        assert!(!lease.set_state(ConnectionState::Admitted));
        assert!(lease.set_state(ConnectionState::HandshakeValidated));
        assert!(lease.set_state(ConnectionState::Classified));
        assert!(lease.set_state(ConnectionState::Admitted));
        assert!(!lease.set_state(ConnectionState::Rejected));
        assert_eq!(lease.record().unwrap().state, ConnectionState::Admitted);
    }

    #[test]
    fn test_purge_stale() {
        let (registry, _) = registry(4);
        let now = Instant::now();
        let idle = ip("10.0.0.8");
        let busy = ip("10.0.0.9");

        drop(registry.register_at(idle, now).unwrap());
        let _live = registry.register_at(busy, now).unwrap();

        assert_eq!(registry.purge_stale_at(now + Duration::from_secs(30)), 0);
        assert_eq!(registry.purge_stale_at(now + Duration::from_secs(120)), 1);
        assert_eq!(registry.tracked_addresses(), 1);
        assert_eq!(registry.active_for(&busy), 1);
    }

    #[test]
    fn test_concurrent_registration_yields_one_record() {
        const THREADS: usize = 16;
        let (registry, _) = registry(1);
        let addr = ip("10.0.0.10");
        let barrier = Barrier::new(THREADS);

        let leases: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        registry.register(addr).ok()
                    })
                })
                .collect();
            handles.into_iter().filter_map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(leases.len(), 1);
        assert_eq!(registry.active_for(&addr), 1);
        assert_eq!(registry.active_connections(), 1);
    }
    #[test]
    fn test_block_placed_while_waiting_for_entry_is_honoured() {
        let (registry, blocklist) = registry(4);
        let addr = ip("10.0.0.11");
        drop(registry.register(addr).unwrap());

        // Hold the address's entry so the registering thread has to wait.
        let guard = registry.slots.get_mut(&addr).unwrap();
        let result = std::thread::scope(|scope| {
            let handle = scope.spawn(|| registry.register(addr).map(|lease| *lease.key()));
            std::thread::sleep(Duration::from_millis(50));
            blocklist.block(&addr, ReasonCode::ManualBlock, Some(Duration::from_secs(60)));
            drop(guard);
            handle.join().unwrap()
        });

        assert!(matches!(result, Err(AdmissionError::Blocked { .. })));
        assert_eq!(registry.active_for(&addr), 0);
    }
}

//! Audit records for rejected, escalated, and degraded admissions.
//!
//! The pipeline emits one [`AuditRecord`] per rejected connection and per
//! connection admitted in degraded mode. Where the records go is up to the
//! [`AuditSink`] the pipeline was built with.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::registry::ConnectionState;
use crate::verdict::ReasonCode;

/// What happened to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Connection was closed.
    Rejected,
    /// Repeated throttling escalated into a block of the address.
    Escalated,
    /// Connection was admitted without a classification (fail-open).
    Degraded,
}

impl AuditKind {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rejected => "rejected",
            Self::Escalated => "escalated",
            Self::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single audit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique event id.
    pub event_id: Uuid,
    /// Event kind.
    pub kind: AuditKind,
    /// Peer address.
    pub address: IpAddr,
    /// Registry connection id, if the connection got that far.
    pub connection_id: Option<u64>,
    /// Reason code.
    pub reason: ReasonCode,
    /// Last state the connection reached before the event.
    pub state: ConnectionState,
    /// Block placed on the address, in milliseconds.
    pub block_duration_ms: Option<u64>,
    /// Free-form operator detail.
    pub detail: Option<String>,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn new(kind: AuditKind, address: IpAddr, reason: ReasonCode, state: ConnectionState) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            address,
            connection_id: None,
            reason,
            state,
            block_duration_ms: None,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the registry connection id.
    #[must_use]
    pub const fn with_connection(mut self, id: u64) -> Self {
        self.connection_id = Some(id);
        self
    }

    /// Attach the block duration.
    #[must_use]
    pub fn with_block_duration(mut self, duration: Option<Duration>) -> Self {
        self.block_duration_ms = duration.map(|d| d.as_millis() as u64);
        self
    }

    /// Attach operator detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Destination for audit records.
///
/// Called inline on the connection's task, so implementations must not block.
pub trait AuditSink: Send + Sync {
    /// Record an event.
    fn record(&self, record: &AuditRecord);
}

/// Sink that writes records as structured `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        let json = record.to_json().unwrap_or_else(|_| "{}".to_string());

        match record.kind {
            AuditKind::Rejected => tracing::info!(
                target: "bastion_audit",
                event_id = %record.event_id,
                kind = %record.kind,
                ip = %record.address,
                reason = %record.reason,
                state = ?record.state,
                event_json = %json,
                "Connection rejected"
            ),
            AuditKind::Escalated => tracing::warn!(
                target: "bastion_audit",
                event_id = %record.event_id,
                kind = %record.kind,
                ip = %record.address,
                reason = %record.reason,
                block_ms = record.block_duration_ms,
                event_json = %json,
                "Address escalated to block"
            ),
            AuditKind::Degraded => tracing::warn!(
                target: "bastion_audit",
                event_id = %record.event_id,
                kind = %record.kind,
                ip = %record.address,
                reason = %record.reason,
                event_json = %json,
                "Connection admitted in degraded mode"
            ),
        }
    }
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _record: &AuditRecord) {}
}

/// Sink that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record so far.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Records of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: AuditKind) -> Vec<AuditRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Check if no records were stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Remove all records.
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Sink that forwards records over a bounded channel.
///
/// Records are dropped, and counted, when the receiver falls behind.
#[derive(Debug)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditRecord>,
    dropped: AtomicU64,
}

impl ChannelAuditSink {
    /// Create a sink and its receiving end.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Records dropped because the channel was full or closed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, record: &AuditRecord) {
        if self.tx.try_send(record.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<T: AuditSink + ?Sized> AuditSink for Arc<T> {
    fn record(&self, record: &AuditRecord) {
        (**self).record(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected() -> AuditRecord {
        AuditRecord::new(
            AuditKind::Rejected,
            "198.51.100.1".parse().unwrap(),
            ReasonCode::MalformedHandshake,
            ConnectionState::Registered,
        )
        .with_connection(7)
    }

    #[test]
    fn test_record_json_shape() {
        let record = rejected()
            .with_block_duration(Some(Duration::from_secs(30)))
            .with_detail("frame too large");
        let value: serde_json::Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();

        assert_eq!(value["kind"], "rejected");
        assert_eq!(value["reason"], "malformed_handshake");
        assert_eq!(value["state"], "registered");
        assert_eq!(value["address"], "198.51.100.1");
        assert_eq!(value["connection_id"], 7);
        assert_eq!(value["block_duration_ms"], 30_000);
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemoryAuditSink::new();
        assert!(sink.is_empty());

        sink.record(&rejected());
        sink.record(&AuditRecord::new(
            AuditKind::Degraded,
            "198.51.100.2".parse().unwrap(),
            ReasonCode::ClassificationTimeout,
            ConnectionState::Classified,
        ));

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.of_kind(AuditKind::Degraded).len(), 1);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelAuditSink::new(1);
        sink.record(&rejected());
        sink.record(&rejected());

        assert_eq!(sink.dropped(), 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.connection_id, Some(7));
    }

    #[test]
    fn test_tracing_and_noop_sinks_accept_all_kinds() {
        let sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(TracingAuditSink), Arc::new(NoopAuditSink)];
        for sink in sinks {
            for kind in [AuditKind::Rejected, AuditKind::Escalated, AuditKind::Degraded] {
                let mut record = rejected();
                record.kind = kind;
                sink.record(&record);
            }
        }
    }

    #[test]
    fn test_sinks_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TracingAuditSink>();
        assert_send_sync::<MemoryAuditSink>();
        assert_send_sync::<ChannelAuditSink>();
    }
}

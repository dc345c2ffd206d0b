use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Engine-wide counters, shared by the acceptor, every worker and every
/// connection record.
pub struct EngineMetrics {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_completed: AtomicU64,
    pub connections_failed: AtomicU64,
    pub connections_retired: AtomicU64,
    pub bytes_to_upstream: AtomicU64,
    pub bytes_to_client: AtomicU64,
    pub sockets_opened: AtomicU64,
    pub sockets_closed: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_completed: AtomicU64::new(0),
            connections_failed: AtomicU64::new(0),
            connections_retired: AtomicU64::new(0),
            bytes_to_upstream: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
            sockets_opened: AtomicU64::new(0),
            sockets_closed: AtomicU64::new(0),
        }
    }

    pub fn record_accept(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.connections_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retired(&self) {
        self.connections_retired.fetch_add(1, Ordering::Relaxed);
        // Don't go below 0
        let _ = self.connections_active.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            n.checked_sub(1)
        });
    }

    pub fn record_bytes_to_upstream(&self, bytes: u64) {
        self.bytes_to_upstream.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_to_client(&self, bytes: u64) {
        self.bytes_to_client.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn socket_opened(&self) {
        self.sockets_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn socket_closed(&self) {
        self.sockets_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    /// Sockets owned by connection records that have not been closed yet.
    pub fn open_sockets(&self) -> u64 {
        let opened = self.sockets_opened.load(Ordering::Relaxed);
        let closed = self.sockets_closed.load(Ordering::Relaxed);
        opened.saturating_sub(closed)
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_completed: self.connections_completed.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            connections_retired: self.connections_retired.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            open_sockets: self.open_sockets(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_completed: u64,
    pub connections_failed: u64,
    pub connections_retired: u64,
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
    pub open_sockets: u64,
    pub timestamp: u64,
}

impl MetricsSummary {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_connections_never_underflow() {
        let metrics = EngineMetrics::new();
        metrics.record_accept();
        metrics.record_retired();
        metrics.record_retired();

        assert_eq!(metrics.active_connections(), 0);
        assert_eq!(metrics.summary().connections_retired, 2);
    }

    #[test]
    fn test_open_sockets_tracks_opened_minus_closed() {
        let metrics = EngineMetrics::new();
        metrics.socket_opened();
        metrics.socket_opened();
        metrics.socket_closed();
        assert_eq!(metrics.open_sockets(), 1);

        metrics.socket_closed();
        assert_eq!(metrics.open_sockets(), 0);
    }

    #[test]
    fn test_summary_serializes_to_json() {
        let metrics = EngineMetrics::new();
        metrics.record_accept();
        metrics.record_bytes_to_client(512);

        let json = metrics.summary().to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["connections_accepted"], 1);
        assert_eq!(value["bytes_to_client"], 512);
    }
}

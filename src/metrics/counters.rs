//! Atomic counters for hot-path metrics.
//!
//! Lock-free counters updated from any task; no per-flow accounting beyond
//! these aggregates (per-flow traffic accounting is an explicit non-goal).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

/// Aggregate, process-wide counters surfaced via the Prometheus exporter
/// and the JSON status endpoint.
pub struct Metrics {
    pub tcp_flows_opened: AtomicU64,
    pub tcp_flows_closed: AtomicU64,
    pub udp_flows_opened: AtomicU64,
    pub udp_flows_closed: AtomicU64,

    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub datagrams_received: AtomicU64,
    pub datagrams_sent: AtomicU64,

    pub dns_allocations: AtomicU64,
    pub dns_epoch_resets: AtomicU64,
    pub dns_upstream_forwards: AtomicU64,

    pub udp_relays_opened: AtomicU64,
    pub udp_relays_evicted: AtomicU64,

    pub errors_total: AtomicU64,
    pub timeouts_total: AtomicU64,

    /// Gauge, not a monotonic counter: current size of the fake-DNS
    /// reverse map, set on every allocation and epoch reset.
    pub fakedns_reverse_map_len: AtomicU64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            tcp_flows_opened: AtomicU64::new(0),
            tcp_flows_closed: AtomicU64::new(0),
            udp_flows_opened: AtomicU64::new(0),
            udp_flows_closed: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            dns_allocations: AtomicU64::new(0),
            dns_epoch_resets: AtomicU64::new(0),
            dns_upstream_forwards: AtomicU64::new(0),
            udp_relays_opened: AtomicU64::new(0),
            udp_relays_evicted: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            fakedns_reverse_map_len: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn tcp_flow_opened(&self) {
        self.tcp_flows_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn tcp_flow_closed(&self) {
        self.tcp_flows_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn udp_flow_opened(&self) {
        self.udp_flows_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn udp_flow_closed(&self) {
        self.udp_flows_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn bytes_rx(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn bytes_tx(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn datagram_rx(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn datagram_tx(&self) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dns_allocation(&self) {
        self.dns_allocations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dns_epoch_reset(&self) {
        self.dns_epoch_resets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dns_upstream_forward(&self) {
        self.dns_upstream_forwards.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn udp_relay_opened(&self) {
        self.udp_relays_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn udp_relay_evicted(&self) {
        self.udp_relays_evicted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn timeout(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_fakedns_reverse_map_len(&self, n: u64) {
        self.fakedns_reverse_map_len.store(n, Ordering::Relaxed);
    }

    /// Snapshot for the JSON status endpoint and the Prometheus sync task.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tcp_flows_opened: self.tcp_flows_opened.load(Ordering::Relaxed),
            tcp_flows_closed: self.tcp_flows_closed.load(Ordering::Relaxed),
            udp_flows_opened: self.udp_flows_opened.load(Ordering::Relaxed),
            udp_flows_closed: self.udp_flows_closed.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            dns_allocations: self.dns_allocations.load(Ordering::Relaxed),
            dns_epoch_resets: self.dns_epoch_resets.load(Ordering::Relaxed),
            dns_upstream_forwards: self.dns_upstream_forwards.load(Ordering::Relaxed),
            udp_relays_opened: self.udp_relays_opened.load(Ordering::Relaxed),
            udp_relays_evicted: self.udp_relays_evicted.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            fakedns_reverse_map_len: self.fakedns_reverse_map_len.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`Metrics`], cheap to serialize.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub tcp_flows_opened: u64,
    pub tcp_flows_closed: u64,
    pub udp_flows_opened: u64,
    pub udp_flows_closed: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub datagrams_received: u64,
    pub datagrams_sent: u64,
    pub dns_allocations: u64,
    pub dns_epoch_resets: u64,
    pub dns_upstream_forwards: u64,
    pub udp_relays_opened: u64,
    pub udp_relays_evicted: u64,
    pub errors_total: u64,
    pub timeouts_total: u64,
    pub fakedns_reverse_map_len: u64,
}

//! Flow correlation (component F support).
//!
//! Flow sessions here have no byte-accounting or admission-control
//! responsibilities (per-flow traffic accounting is an explicit
//! non-goal), so this keeps only what logging needs — a monotonic
//! per-flow correlation id, plus aggregate counts surfaced through
//! `metrics`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

/// A monotonically increasing identifier used only for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId(u64);

impl FlowId {
    pub fn next() -> Self {
        Self(NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// What kind of flow a [`FlowId`] was assigned to, for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Tcp,
    Udp,
}

/// RAII guard that records flow open/close in the aggregate counters.
/// Constructed once per accepted flow; dropping it (on any exit path)
/// records the close, so forwarder.rs never has to remember to do so on
/// every error branch.
pub struct FlowGuard {
    id: FlowId,
    kind: FlowKind,
}

impl FlowGuard {
    pub fn open(kind: FlowKind) -> Self {
        let id = FlowId::next();
        match kind {
            FlowKind::Tcp => crate::metrics::METRICS.tcp_flow_opened(),
            FlowKind::Udp => crate::metrics::METRICS.udp_flow_opened(),
        }
        tracing::debug!(flow_id = %id, kind = ?kind, "flow opened");
        Self { id, kind }
    }

    pub fn id(&self) -> FlowId {
        self.id
    }
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        match self.kind {
            FlowKind::Tcp => crate::metrics::METRICS.tcp_flow_closed(),
            FlowKind::Udp => crate::metrics::METRICS.udp_flow_closed(),
        }
        tracing::debug!(flow_id = %self.id, kind = ?self.kind, "flow closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_ids_are_distinct_and_monotonic() {
        let a = FlowId::next();
        let b = FlowId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn guard_drop_does_not_panic() {
        let guard = FlowGuard::open(FlowKind::Tcp);
        drop(guard);
    }
}

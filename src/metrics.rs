//! Counters for transport-internal faults and recovery activity. These are
//! the sink for everything the propagation policy absorbs instead of
//! surfacing per-packet.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct BusMetrics {
    pub(crate) malformed_packets: AtomicU64,
    pub(crate) duplicate_packets: AtomicU64,
    pub(crate) decrypt_failures: AtomicU64,
    pub(crate) naks_sent: AtomicU64,
    pub(crate) retransmits_served: AtomicU64,
    pub(crate) sends_failed: AtomicU64,
    pub(crate) losses_declared: AtomicU64,
    pub(crate) messages_delivered: AtomicU64,
}

impl BusMetrics {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            duplicate_packets: self.duplicate_packets.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            naks_sent: self.naks_sent.load(Ordering::Relaxed),
            retransmits_served: self.retransmits_served.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
            losses_declared: self.losses_declared.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub struct MetricsSnapshot {
    pub malformed_packets: u64,
    pub duplicate_packets: u64,
    pub decrypt_failures: u64,
    pub naks_sent: u64,
    pub retransmits_served: u64,
    pub sends_failed: u64,
    pub losses_declared: u64,
    pub messages_delivered: u64,
}

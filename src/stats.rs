//! Observability counters. Dropped data is surfaced here rather than as errors.

use crate::flow::DecodeReport;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EdgeStats {
    /// Datagrams handed to the decoder
    pub packets_received: AtomicU64,
    /// Packets dropped whole (unsupported version, truncated header)
    pub packets_rejected: AtomicU64,
    pub malformed_flowsets: AtomicU64,
    pub unknown_template_sets: AtomicU64,
    pub invalid_templates: AtomicU64,
    pub records_ingested: AtomicU64,
    /// Records with no usable endpoint key
    pub records_unkeyed: AtomicU64,
    pub endpoints_evicted: AtomicU64,
    pub batches_sent: AtomicU64,
    /// Delivery attempts that failed (batch kept for retry)
    pub delivery_failures: AtomicU64,
    /// Batches pushed out of a full retry buffer
    pub batches_dropped: AtomicU64,
    pub sketches_dropped: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub packets_received: u64,
    pub packets_rejected: u64,
    pub malformed_flowsets: u64,
    pub unknown_template_sets: u64,
    pub invalid_templates: u64,
    pub records_ingested: u64,
    pub records_unkeyed: u64,
    pub endpoints_evicted: u64,
    pub batches_sent: u64,
    pub delivery_failures: u64,
    pub batches_dropped: u64,
    pub sketches_dropped: u64,
}

pub(crate) fn bump(counter: &AtomicU64, n: u64) {
    if n > 0 {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

impl EdgeStats {
    pub(crate) fn record_report(&self, report: &DecodeReport) {
        bump(&self.malformed_flowsets, report.malformed_sets() as u64);
        bump(&self.unknown_template_sets, report.unknown_template_sets() as u64);
        bump(&self.invalid_templates, report.invalid_templates() as u64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            packets_received: get(&self.packets_received),
            packets_rejected: get(&self.packets_rejected),
            malformed_flowsets: get(&self.malformed_flowsets),
            unknown_template_sets: get(&self.unknown_template_sets),
            invalid_templates: get(&self.invalid_templates),
            records_ingested: get(&self.records_ingested),
            records_unkeyed: get(&self.records_unkeyed),
            endpoints_evicted: get(&self.endpoints_evicted),
            batches_sent: get(&self.batches_sent),
            delivery_failures: get(&self.delivery_failures),
            batches_dropped: get(&self.batches_dropped),
            sketches_dropped: get(&self.sketches_dropped),
        }
    }
}

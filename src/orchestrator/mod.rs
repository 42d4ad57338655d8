//! Edge orchestrator: feeds flow records into the sketch store and runs the periodic
//! streaming cycle that ships serialized sketches upstream.
//!
//! Ingestion and flushing share the store behind one mutex. The flush holds it only
//! while draining; serialization of the batch for the wire and the transport call
//! happen with no store lock held.

mod retry;

pub use retry::{Backoff, RetryBuffer};

use crate::config::{EdgeConfig, FlushConfig};
use crate::error::{ConfigError, DecodeError, TransportError};
use crate::flow::{DecodeReport, EndpointKey, FlowDecoder, FlowRecord, TemplateManager};
use crate::stats::{bump, EdgeStats};
use crate::store::{EncodedSketch, SketchStore};
use crate::uplink::{SketchBatch, Transport};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OrchestratorState {
    Idle = 0,
    Collecting = 1,
    Flushing = 2,
    Stopped = 3,
}

impl From<u8> for OrchestratorState {
    fn from(v: u8) -> Self {
        match v {
            0 => OrchestratorState::Idle,
            1 => OrchestratorState::Collecting,
            2 => OrchestratorState::Flushing,
            _ => OrchestratorState::Stopped,
        }
    }
}

/// Outcome of one streaming cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Sketches serialized out of the store this cycle
    pub drained: usize,
    pub delivered_batches: usize,
    pub delivered_sketches: usize,
    /// Batches still waiting for redelivery
    pub pending_batches: usize,
    /// Batches pushed out of the retry buffer this cycle
    pub dropped_batches: usize,
    /// Delivery was not attempted because the backoff had not elapsed
    pub skipped_for_backoff: bool,
    pub failed: bool,
}

pub struct EdgeOrchestrator<T: Transport> {
    device_id: String,
    flush: FlushConfig,
    endpoint_key: EndpointKey,
    decoder: FlowDecoder,
    store: Mutex<SketchStore>,
    retry: Mutex<RetryBuffer>,
    backoff: Mutex<Backoff>,
    /// One streaming cycle at a time
    flush_gate: tokio::sync::Mutex<()>,
    transport: T,
    state: AtomicU8,
    stats: EdgeStats,
}

impl<T: Transport> EdgeOrchestrator<T> {
    pub fn new(config: &EdgeConfig, transport: T) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = SketchStore::new(config.sketch, config.store.max_endpoints, config.store.retention)?;
        let templates = Arc::new(TemplateManager::new(config.templates.max_per_exporter));
        let flush = config.flush.clone();
        let backoff = Backoff::new(
            Duration::from_millis(flush.backoff_initial_ms),
            Duration::from_millis(flush.backoff_max_ms),
            flush.backoff_multiplier,
        );
        Ok(Self {
            device_id: config.device_id.clone(),
            endpoint_key: config.store.endpoint_key,
            decoder: FlowDecoder::new(templates),
            store: Mutex::new(store),
            retry: Mutex::new(RetryBuffer::new(flush.retry_capacity)),
            backoff: Mutex::new(backoff),
            flush_gate: tokio::sync::Mutex::new(()),
            transport,
            state: AtomicU8::new(OrchestratorState::Idle as u8),
            stats: EdgeStats::default(),
            flush,
        })
    }

    pub fn state(&self) -> OrchestratorState {
        OrchestratorState::from(self.state.load(Ordering::SeqCst))
    }

    /// Move to `next` unless already stopped. Stopped is terminal.
    fn transition(&self, next: OrchestratorState) {
        let _ = self.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
            (OrchestratorState::from(cur) != OrchestratorState::Stopped).then_some(next as u8)
        });
    }

    pub fn start(&self) {
        if self.state() == OrchestratorState::Idle {
            self.transition(OrchestratorState::Collecting);
            info!(device_id = %self.device_id, "orchestrator collecting");
        }
    }

    pub fn stats(&self) -> &EdgeStats {
        &self.stats
    }

    pub fn decoder(&self) -> &FlowDecoder {
        &self.decoder
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Run `f` against the store under its lock.
    pub fn with_store<R>(&self, f: impl FnOnce(&SketchStore) -> R) -> R {
        f(&self.store.lock())
    }

    pub fn pending_batches(&self) -> usize {
        self.retry.lock().len()
    }

    pub fn pending_batch_ids(&self) -> Vec<Uuid> {
        self.retry.lock().batch_ids()
    }

    /// Apply one record. Returns false when the record was not applied (no endpoint
    /// key, or the orchestrator has stopped).
    pub fn ingest(&self, record: &FlowRecord) -> bool {
        if self.state() == OrchestratorState::Stopped {
            return false;
        }
        let mut store = self.store.lock();
        self.apply(&mut store, record)
    }

    pub fn ingest_batch(&self, records: &[FlowRecord]) -> usize {
        if self.state() == OrchestratorState::Stopped {
            return 0;
        }
        let mut store = self.store.lock();
        records.iter().filter(|r| self.apply(&mut store, r)).count()
    }

    /// Decode one export packet and apply every record in it.
    pub fn ingest_packet(&self, packet: &Bytes, exporter: IpAddr) -> Result<DecodeReport, DecodeError> {
        bump(&self.stats.packets_received, 1);
        // Templates are still learned after stop; records are not applied.
        let accepting = self.state() != OrchestratorState::Stopped;
        let mut store = self.store.lock();
        let result = self.decoder.decode_with(packet, exporter, |record| {
            if accepting {
                self.apply(&mut store, record);
            }
        });
        drop(store);
        match result {
            Ok(report) => {
                self.stats.record_report(&report);
                if !report.issues.is_empty() {
                    debug!(exporter = %exporter, issues = ?report.issues, "flowset issues");
                }
                Ok(report)
            }
            Err(e) => {
                bump(&self.stats.packets_rejected, 1);
                Err(e)
            }
        }
    }

    fn apply(&self, store: &mut SketchStore, record: &FlowRecord) -> bool {
        let Some(endpoint) = record.endpoint(self.endpoint_key) else {
            bump(&self.stats.records_unkeyed, 1);
            return false;
        };
        if let Some(evicted) = store.update(endpoint, record) {
            bump(&self.stats.endpoints_evicted, 1);
            debug!(
                endpoint = %evicted.id(),
                flows = evicted.flow_count(),
                "endpoint sketch evicted at capacity"
            );
        }
        bump(&self.stats.records_ingested, 1);
        true
    }

    /// One streaming cycle: drain the store into a batch, queue it, and try to deliver
    /// every pending batch oldest first.
    pub async fn flush_cycle(&self) -> FlushReport {
        let _gate = self.flush_gate.lock().await;
        self.transition(OrchestratorState::Flushing);
        let sketches = self.drain_store(Utc::now().timestamp_millis());
        let report = self.ship(sketches, false).await;
        self.transition(OrchestratorState::Collecting);
        report
    }

    fn drain_store(&self, at_ms: i64) -> Vec<EncodedSketch> {
        self.store.lock().drain(at_ms).collect()
    }

    fn take_store(&self, at_ms: i64) -> Vec<EncodedSketch> {
        self.store.lock().take_all(at_ms)
    }

    async fn ship(&self, sketches: Vec<EncodedSketch>, ignore_backoff: bool) -> FlushReport {
        let mut report = FlushReport {
            drained: sketches.len(),
            ..Default::default()
        };
        if !sketches.is_empty() {
            let batch = Arc::new(SketchBatch::new(self.device_id.as_str(), sketches));
            if let Some(dropped) = self.enqueue(batch) {
                report.dropped_batches += 1;
                bump(&self.stats.batches_dropped, 1);
                bump(&self.stats.sketches_dropped, dropped.len() as u64);
                warn!(
                    batch_id = %dropped.batch_id,
                    sketches = dropped.len(),
                    "retry buffer full; oldest batch dropped"
                );
            }
        }

        if !ignore_backoff && !self.backoff_ready() {
            report.skipped_for_backoff = true;
        } else {
            self.deliver_pending(&mut report).await;
        }
        report.pending_batches = self.pending_batches();
        info!(
            drained = report.drained,
            delivered = report.delivered_batches,
            pending = report.pending_batches,
            dropped = report.dropped_batches,
            "flush cycle complete"
        );
        debug!(stats = ?self.stats.snapshot(), "edge stats");
        report
    }

    fn enqueue(&self, batch: Arc<SketchBatch>) -> Option<Arc<SketchBatch>> {
        self.retry.lock().push(batch)
    }

    fn backoff_ready(&self) -> bool {
        self.backoff.lock().ready(Instant::now())
    }

    fn next_pending(&self) -> Option<Arc<SketchBatch>> {
        self.retry.lock().front()
    }

    async fn deliver_pending(&self, report: &mut FlushReport) {
        let timeout = Duration::from_millis(self.flush.send_timeout_ms);
        while let Some(batch) = self.next_pending() {
            let result = match tokio::time::timeout(timeout, self.transport.send(&batch)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(self.flush.send_timeout_ms)),
            };
            match result {
                Ok(()) => {
                    self.retry.lock().remove(batch.batch_id);
                    self.backoff.lock().on_success();
                    bump(&self.stats.batches_sent, 1);
                    report.delivered_batches += 1;
                    report.delivered_sketches += batch.len();
                }
                Err(e) => {
                    let delay = self.backoff.lock().on_failure(Instant::now());
                    bump(&self.stats.delivery_failures, 1);
                    report.failed = true;
                    warn!(
                        batch_id = %batch.batch_id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "uplink delivery failed"
                    );
                    break;
                }
            }
        }
    }

    /// Periodic streaming loop. Returns after the final flush once `shutdown` flips
    /// to true or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> FlushReport {
        self.start();
        let period = Duration::from_secs(self.flush.interval_secs);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown().await
    }

    /// Stop ingesting, then serialize every sketch and make one best-effort delivery
    /// attempt within the shutdown budget.
    pub async fn shutdown(&self) -> FlushReport {
        self.transition(OrchestratorState::Stopped);
        let budget = Duration::from_millis(self.flush.shutdown_timeout_ms);
        let report = match tokio::time::timeout(budget, self.final_flush()).await {
            Ok(report) => report,
            Err(_) => {
                warn!(budget_ms = self.flush.shutdown_timeout_ms, "final flush abandoned");
                FlushReport {
                    pending_batches: self.pending_batches(),
                    ..Default::default()
                }
            }
        };
        info!(stats = ?self.stats.snapshot(), "orchestrator stopped");
        report
    }

    async fn final_flush(&self) -> FlushReport {
        let _gate = self.flush_gate.lock().await;
        let sketches = self.take_store(Utc::now().timestamp_millis());
        self.ship(sketches, true).await
    }
}

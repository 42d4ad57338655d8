//! Orchestrator: ingestion, streaming cycle, retry buffer, backoff and shutdown.

use flowprint_edge::config::EdgeConfig;
use flowprint_edge::error::{DecodeError, TransportError};
use flowprint_edge::flow::{EndpointId, EndpointKey, FieldSpec, FlowRecord, PacketBuilder};
use flowprint_edge::orchestrator::{EdgeOrchestrator, OrchestratorState};
use flowprint_edge::sketch::EndpointSketch;
use flowprint_edge::uplink::{SketchBatch, Transport};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const EXPORTER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10));

#[derive(Default)]
struct MockTransport {
    fail: AtomicBool,
    delay: Option<Duration>,
    attempts: AtomicUsize,
    sent: Mutex<Vec<SketchBatch>>,
}

impl MockTransport {
    fn failing() -> Self {
        let t = Self::default();
        t.fail.store(true, Ordering::SeqCst);
        t
    }

    fn sent_ids(&self) -> Vec<uuid::Uuid> {
        self.sent.lock().iter().map(|b| b.batch_id).collect()
    }
}

impl Transport for MockTransport {
    async fn send(&self, batch: &SketchBatch) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Status {
                status: 503,
                body: "backend unavailable".to_string(),
            });
        }
        self.sent.lock().push(batch.clone());
        Ok(())
    }
}

fn test_config() -> EdgeConfig {
    let mut config = EdgeConfig::default();
    config.device_id = "edge-test".to_string();
    config.sketch.precision = 10;
    config.sketch.width = 64;
    config.flush.interval_secs = 3600;
    config.flush.retry_capacity = 2;
    config.flush.backoff_initial_ms = 0;
    config.flush.backoff_max_ms = 0;
    config.flush.send_timeout_ms = 1_000;
    config.flush.shutdown_timeout_ms = 2_000;
    config
}

fn host(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
}

fn record(src: u8, dst_port: u16) -> FlowRecord {
    FlowRecord {
        src_addr: Some(host(src)),
        dst_addr: Some(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))),
        src_port: 50_000,
        dst_port,
        protocol: 6,
        export_ms: 1_700_000_000_000,
        ..FlowRecord::default()
    }
}

fn five_field_packet(records: &[FlowRecord]) -> Bytes {
    let fields = vec![
        FieldSpec::new(8, 4),
        FieldSpec::new(12, 4),
        FieldSpec::new(7, 2),
        FieldSpec::new(11, 2),
        FieldSpec::new(4, 1),
    ];
    let mut b = PacketBuilder::v9(1).export_secs(1_700_000_000).sys_uptime_ms(60_000);
    b.template(256, &fields).data(256, &fields, records);
    b.build()
}

#[tokio::test]
async fn end_to_end_packet_to_fingerprint() {
    let orch = EdgeOrchestrator::new(&test_config(), MockTransport::default()).unwrap();
    let packet = five_field_packet(&[record(5, 80), record(5, 443), record(5, 443)]);

    let report = orch.ingest_packet(&packet, EXPORTER).unwrap();
    assert_eq!(report.records, 3);

    let endpoint = EndpointId::Ip(host(5));
    orch.with_store(|store| {
        let sketch = store.get(&endpoint).unwrap();
        assert_eq!(sketch.flow_count(), 3);
        assert!((sketch.distinct_peers() - 1.0).abs() < 0.01);
        assert!(sketch.port_estimate(443) >= 2);
        assert!(sketch.port_estimate(80) >= 1);
    });

    let flush = orch.flush_cycle().await;
    assert_eq!(flush.drained, 1);
    assert_eq!(flush.delivered_batches, 1);
    assert_eq!(flush.pending_batches, 0);

    let sent = orch.transport().sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].device_id, "edge-test");
    let sketch = EndpointSketch::deserialize(&sent[0].sketches[0].payload).unwrap();
    assert_eq!(sketch.id(), endpoint);
    assert_eq!(sketch.flow_count(), 3);

    let stats = orch.stats().snapshot();
    assert_eq!(stats.packets_received, 1);
    assert_eq!(stats.records_ingested, 3);
    assert_eq!(stats.batches_sent, 1);
}

#[tokio::test]
async fn unsupported_version_changes_nothing() {
    let orch = EdgeOrchestrator::new(&test_config(), MockTransport::default()).unwrap();
    let mut raw = vec![0u8; 24];
    raw[1] = 5;
    let err = orch.ingest_packet(&Bytes::from(raw), EXPORTER).unwrap_err();
    assert_eq!(err, DecodeError::UnsupportedVersion(5));
    assert_eq!(orch.with_store(|s| s.len()), 0);
    assert_eq!(orch.decoder().templates().exporter_count(), 0);
    assert_eq!(orch.stats().snapshot().packets_rejected, 1);
}

#[tokio::test]
async fn backend_outage_keeps_newest_batches() {
    let orch = EdgeOrchestrator::new(&test_config(), MockTransport::failing()).unwrap();

    for cycle in 0..3u8 {
        orch.ingest(&record(cycle + 1, 443));
        let report = orch.flush_cycle().await;
        assert!(report.failed);
        assert_eq!(report.delivered_batches, 0);
    }
    assert_eq!(orch.pending_batches(), 2);
    let retained = orch.pending_batch_ids();
    let stats = orch.stats().snapshot();
    assert_eq!(stats.batches_dropped, 1);
    assert_eq!(stats.sketches_dropped, 1);
    assert_eq!(stats.delivery_failures, 3);

    orch.transport().fail.store(false, Ordering::SeqCst);
    let report = orch.flush_cycle().await;
    assert_eq!(report.drained, 0);
    assert_eq!(report.delivered_batches, 2);
    assert_eq!(report.pending_batches, 0);
    assert_eq!(orch.transport().sent_ids(), retained);
    assert_eq!(orch.pending_batches(), 0);
}

#[tokio::test]
async fn backoff_defers_the_next_attempt() {
    let mut config = test_config();
    config.flush.backoff_initial_ms = 60_000;
    config.flush.backoff_max_ms = 600_000;
    let orch = EdgeOrchestrator::new(&config, MockTransport::failing()).unwrap();

    orch.ingest(&record(1, 443));
    assert!(orch.flush_cycle().await.failed);
    orch.ingest(&record(2, 443));
    let report = orch.flush_cycle().await;
    assert!(report.skipped_for_backoff);
    assert_eq!(report.pending_batches, 2);
    assert_eq!(orch.transport().attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn slow_backend_times_out() {
    let mut config = test_config();
    config.flush.send_timeout_ms = 20;
    let transport = MockTransport {
        delay: Some(Duration::from_secs(5)),
        ..MockTransport::default()
    };
    let orch = EdgeOrchestrator::new(&config, transport).unwrap();
    orch.ingest(&record(1, 443));
    let report = orch.flush_cycle().await;
    assert!(report.failed);
    assert_eq!(report.pending_batches, 1);
    assert!(orch.transport().sent.lock().is_empty());
}

#[tokio::test]
async fn ingestion_continues_while_a_send_is_in_flight() {
    let transport = MockTransport {
        delay: Some(Duration::from_millis(300)),
        ..MockTransport::default()
    };
    let orch = Arc::new(EdgeOrchestrator::new(&test_config(), transport).unwrap());
    orch.ingest(&record(1, 443));

    let flushing = Arc::clone(&orch);
    let flush = tokio::spawn(async move { flushing.flush_cycle().await });
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while orch.transport().attempts.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "send never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(orch.ingest(&record(2, 80)));
    let report = orch
        .ingest_packet(&five_field_packet(&[record(3, 22), record(3, 22)]), EXPORTER)
        .unwrap();
    assert_eq!(report.records, 2);
    assert!(!flush.is_finished());
    orch.with_store(|store| {
        assert!(store.contains(&EndpointId::Ip(host(2))));
        assert_eq!(store.get(&EndpointId::Ip(host(3))).map(|s| s.flow_count()), Some(2));
    });

    let report = flush.await.unwrap();
    assert_eq!(report.drained, 1);
    assert_eq!(report.delivered_batches, 1);
    assert_eq!(orch.with_store(|s| s.len()), 2);
}

#[tokio::test]
async fn records_without_key_are_counted() {
    let mut config = test_config();
    config.store.endpoint_key = EndpointKey::SourceMac;
    let orch = EdgeOrchestrator::new(&config, MockTransport::default()).unwrap();
    assert!(!orch.ingest(&record(1, 80)));

    let mut with_mac = record(1, 80);
    with_mac.src_mac = Some([0x02, 0, 0, 0, 0, 1]);
    assert!(orch.ingest(&with_mac));

    let stats = orch.stats().snapshot();
    assert_eq!(stats.records_unkeyed, 1);
    assert_eq!(stats.records_ingested, 1);
    assert!(orch.with_store(|s| s.contains(&EndpointId::Mac([0x02, 0, 0, 0, 0, 1]))));
}

#[tokio::test]
async fn empty_cycle_sends_nothing() {
    let orch = EdgeOrchestrator::new(&test_config(), MockTransport::default()).unwrap();
    let report = orch.flush_cycle().await;
    assert_eq!(report.drained, 0);
    assert_eq!(report.delivered_batches, 0);
    assert_eq!(orch.transport().attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn shutdown_flushes_everything_and_stops() {
    let mut config = test_config();
    config.store.retention = flowprint_edge::store::RetentionPolicy::Cumulative;
    let orch = Arc::new(EdgeOrchestrator::new(&config, MockTransport::default()).unwrap());
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(Arc::clone(&orch).run(rx));

    orch.ingest(&record(1, 22));
    orch.ingest(&record(2, 22));
    tokio::task::yield_now().await;
    tx.send(true).unwrap();

    let report = task.await.unwrap();
    assert_eq!(report.drained, 2);
    assert_eq!(report.delivered_sketches, 2);
    assert_eq!(orch.state(), OrchestratorState::Stopped);
    assert_eq!(orch.with_store(|s| s.len()), 0);
    assert!(!orch.ingest(&record(3, 22)));
}

#[test]
fn invalid_config_is_refused() {
    let mut config = test_config();
    config.flush.retry_capacity = 0;
    assert!(EdgeOrchestrator::new(&config, MockTransport::default()).is_err());
}

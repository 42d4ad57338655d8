//! Integration test: config load, synthetic feed, UDP collector, offline uplink.

use flowprint_edge::collector::{SyntheticFeed, UdpCollector};
use flowprint_edge::config::{EdgeConfig, SourceKind, SyntheticConfig};
use flowprint_edge::error::ConfigError;
use flowprint_edge::flow::{template_fields, EndpointKey, SyntheticSource, SYNTHETIC_TEMPLATE_ID};
use flowprint_edge::orchestrator::EdgeOrchestrator;
use flowprint_edge::sketch::MergePolicy;
use flowprint_edge::store::RetentionPolicy;
use flowprint_edge::uplink::{SketchBatch, Transport, Uplink};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[test]
fn config_load_default() {
    let c = EdgeConfig::load(Path::new("nonexistent.json")).unwrap();
    assert_eq!(c.collector.source, SourceKind::Udp);
    assert_eq!(c.sketch.precision, 12);
    assert_eq!(c.store.retention, RetentionPolicy::Tumbling);
    assert!(!c.uplink.enabled);
}

#[test]
fn config_load_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let mut f = std::fs::File::create(&path).unwrap();
    write!(
        f,
        r#"{{
            "device_id": "edge-7",
            "sketch": {{ "precision": 14, "merge_policy": "max" }},
            "store": {{ "retention": "rolling_counters", "endpoint_key": "source_mac" }},
            "collector": {{ "source": "synthetic" }}
        }}"#
    )
    .unwrap();

    let c = EdgeConfig::load(&path).unwrap();
    assert_eq!(c.device_id, "edge-7");
    assert_eq!(c.sketch.precision, 14);
    assert_eq!(c.sketch.width, 128);
    assert_eq!(c.sketch.merge_policy, MergePolicy::Max);
    assert_eq!(c.store.retention, RetentionPolicy::RollingCounters);
    assert_eq!(c.store.endpoint_key, EndpointKey::SourceMac);
    assert_eq!(c.collector.source, SourceKind::Synthetic);
    assert_eq!(c.flush.interval_secs, 60);
}

#[test]
fn config_rejects_bad_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");

    std::fs::write(&path, r#"{ "sketch": { "precision": 20 } }"#).unwrap();
    assert!(matches!(EdgeConfig::load(&path), Err(ConfigError::Sketch(_))));

    std::fs::write(&path, r#"{ "uplink": { "enabled": true } }"#).unwrap();
    assert!(matches!(EdgeConfig::load(&path), Err(ConfigError::Invalid(_))));

    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(EdgeConfig::load(&path), Err(ConfigError::Parse(_))));
}

#[test]
fn synthetic_source_is_reproducible() {
    let config = SyntheticConfig::default();
    let mut a = SyntheticSource::new(&config, 1_700_000_000_000);
    let mut b = SyntheticSource::new(&config, 1_700_000_000_000);
    assert_eq!(a.batch(50), b.batch(50));
    assert_eq!(template_fields().len(), 10);
    assert!(SYNTHETIC_TEMPLATE_ID >= 256);
}

#[tokio::test]
async fn synthetic_feed_populates_store() {
    let mut config = EdgeConfig::default();
    config.collector.synthetic.endpoints = 8;
    config.collector.synthetic.records_per_tick = 1_500;
    let orch = Arc::new(EdgeOrchestrator::new(&config, Uplink::Offline).unwrap());
    let feed = SyntheticFeed::new(config.collector.synthetic.clone(), Arc::clone(&orch));

    let mut source = SyntheticSource::new(&config.collector.synthetic, 1_700_000_000_000);
    assert_eq!(feed.tick(&mut source), 1_500);
    assert_eq!(orch.with_store(|s| s.len()), 8);

    // Offline uplink accepts every batch.
    let report = orch.flush_cycle().await;
    assert_eq!(report.drained, 8);
    assert_eq!(report.delivered_batches, 1);
}

#[tokio::test]
async fn udp_collector_ingests_datagrams() {
    let mut config = EdgeConfig::default();
    config.collector.bind_addr = "127.0.0.1:0".to_string();
    let orch = Arc::new(EdgeOrchestrator::new(&config, Uplink::Offline).unwrap());
    let collector = UdpCollector::bind(&config.collector, Arc::clone(&orch)).await.unwrap();
    let addr = collector.local_addr().unwrap();

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(async move { collector.run(rx).await });

    let mut source = SyntheticSource::new(&config.collector.synthetic, 1_700_000_000_000);
    let packet = source.packet(20);
    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(&packet, addr).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while orch.stats().snapshot().records_ingested < 20 {
        assert!(tokio::time::Instant::now() < deadline, "datagram not ingested");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    task.await.unwrap();
    assert_eq!(orch.stats().snapshot().packets_received, 1);
}

#[tokio::test]
async fn offline_uplink_accepts_batches() {
    let uplink = Uplink::from_config(&EdgeConfig::default().uplink);
    assert!(matches!(uplink, Uplink::Offline));
    let batch = SketchBatch::new("edge-local", Vec::new());
    assert!(batch.is_empty());
    uplink.send(&batch).await.unwrap();
}

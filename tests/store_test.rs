//! Sketch store: admission, least-recently-active eviction and retention policies.

use flowprint_edge::config::SketchConfig;
use flowprint_edge::flow::{EndpointId, FlowRecord};
use flowprint_edge::sketch::EndpointSketch;
use flowprint_edge::store::{RetentionPolicy, SketchStore};
use std::net::{IpAddr, Ipv4Addr};

fn small_config() -> SketchConfig {
    SketchConfig {
        precision: 6,
        width: 16,
        depth: 2,
        ..SketchConfig::default()
    }
}

fn host(last: u8) -> EndpointId {
    EndpointId::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)))
}

fn record_at(src: u8, dst_port: u16, end_ms: u64) -> FlowRecord {
    FlowRecord {
        src_addr: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, src))),
        dst_addr: Some(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1))),
        dst_port,
        protocol: 6,
        bytes: 100,
        packets: 1,
        flow_start_ms: Some(end_ms.saturating_sub(10)),
        flow_end_ms: Some(end_ms),
        ..FlowRecord::default()
    }
}

#[test]
fn update_admits_and_accumulates() {
    let mut store = SketchStore::new(small_config(), 8, RetentionPolicy::Tumbling).unwrap();
    assert!(store.is_empty());
    store.update(host(1), &record_at(1, 80, 1_000));
    store.update(host(1), &record_at(1, 443, 2_000));
    store.update(host(2), &record_at(2, 22, 1_500));
    assert_eq!(store.len(), 2);

    let sketch = store.get(&host(1)).unwrap();
    assert_eq!(sketch.flow_count(), 2);
    assert_eq!(sketch.last_seen_ms(), 2_000);
    assert_eq!(sketch.window().0, 990);
    assert_eq!(store.oldest(), Some((host(2), 1_500)));
}

#[test]
fn capacity_evicts_least_recently_active() {
    let mut store = SketchStore::new(small_config(), 3, RetentionPolicy::Tumbling).unwrap();
    store.update(host(1), &record_at(1, 80, 1_000));
    store.update(host(2), &record_at(2, 80, 2_000));
    store.update(host(3), &record_at(3, 80, 3_000));
    // Host 1 becomes the most recently active.
    store.update(host(1), &record_at(1, 80, 4_000));

    let evicted = store.update(host(4), &record_at(4, 80, 5_000)).unwrap();
    assert_eq!(evicted.id(), host(2));
    assert_eq!(evicted.flow_count(), 1);
    assert_eq!(store.len(), 3);
    assert!(!store.contains(&host(2)));
    assert!(store.contains(&host(1)));
    assert_eq!(store.evictions(), 1);

    // Existing endpoints never evict.
    assert!(store.update(host(3), &record_at(3, 80, 6_000)).is_none());
    assert_eq!(store.len(), 3);
}

#[test]
fn tumbling_drain_empties_the_store() {
    let mut store = SketchStore::new(small_config(), 8, RetentionPolicy::Tumbling).unwrap();
    for src in 1..=3 {
        store.update(host(src), &record_at(src, 443, 1_000));
    }
    let mut drained: Vec<_> = store.drain(10_000).collect();
    assert_eq!(drained.len(), 3);
    assert!(store.is_empty());
    assert!(store.oldest().is_none());

    drained.sort_by_key(|s| s.endpoint);
    assert_eq!(drained[0].endpoint, host(1));
    let sketch = EndpointSketch::deserialize(&drained[0].payload).unwrap();
    assert_eq!(sketch.id(), host(1));
    assert_eq!(sketch.flow_count(), 1);
    assert_eq!(sketch.window().1, 10_000);
    assert!(sketch.port_estimate(443) >= 1);

    assert_eq!(store.drain(11_000).count(), 0);
}

#[test]
fn cumulative_drain_keeps_everything() {
    let mut store = SketchStore::new(small_config(), 8, RetentionPolicy::Cumulative).unwrap();
    store.update(host(1), &record_at(1, 80, 1_000));
    assert_eq!(store.drain(5_000).count(), 1);
    store.update(host(1), &record_at(1, 80, 6_000));

    let drained: Vec<_> = store.drain(10_000).collect();
    let sketch = EndpointSketch::deserialize(&drained[0].payload).unwrap();
    assert_eq!(sketch.flow_count(), 2);
    assert_eq!(sketch.window(), (990, 10_000));
    assert_eq!(store.len(), 1);
}

#[test]
fn rolling_drain_resets_counters_only() {
    let mut store = SketchStore::new(small_config(), 8, RetentionPolicy::RollingCounters).unwrap();
    store.update(host(1), &record_at(1, 80, 1_000));
    store.update(host(1), &record_at(1, 80, 2_000));
    let first: Vec<_> = store.drain(5_000).collect();
    let first = EndpointSketch::deserialize(&first[0].payload).unwrap();
    assert_eq!(first.flow_count(), 2);

    let kept = store.get(&host(1)).unwrap();
    assert_eq!(kept.flow_count(), 0);
    assert_eq!(kept.window(), (5_000, 5_000));
    assert!(kept.port_estimate(80) >= 2);

    store.update(host(1), &record_at(1, 443, 6_000));
    let second: Vec<_> = store.drain(9_000).collect();
    let second = EndpointSketch::deserialize(&second[0].payload).unwrap();
    assert_eq!(second.flow_count(), 1);
    assert_eq!(second.window(), (5_000, 9_000));
    assert!(second.port_estimate(80) >= 2);
}

#[test]
fn take_all_ignores_retention() {
    let mut store = SketchStore::new(small_config(), 8, RetentionPolicy::Cumulative).unwrap();
    store.update(host(1), &record_at(1, 80, 1_000));
    store.update(host(2), &record_at(2, 80, 1_000));
    assert_eq!(store.take_all(2_000).len(), 2);
    assert!(store.is_empty());
}

#[test]
fn invalid_sketch_config_is_refused() {
    let config = SketchConfig {
        precision: 2,
        ..SketchConfig::default()
    };
    assert!(SketchStore::new(config, 8, RetentionPolicy::Tumbling).is_err());
}

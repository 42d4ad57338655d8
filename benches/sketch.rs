//! Sketch benchmark: per-item update cost and full-fingerprint serialization.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flowprint_edge::config::{SketchConfig, SyntheticConfig};
use flowprint_edge::flow::{EndpointId, SyntheticSource};
use flowprint_edge::sketch::{CountMinSketch, EndpointSketch, HyperLogLog, MergePolicy};
use std::net::{IpAddr, Ipv4Addr};

fn bench_hll_add(c: &mut Criterion) {
    let mut hll = HyperLogLog::new(12, 7).unwrap();
    let mut i: u32 = 0;
    c.bench_function("hll_add", |b| {
        b.iter(|| {
            i = i.wrapping_add(1);
            hll.add(black_box(&i.to_be_bytes()));
        })
    });
}

fn bench_cms_add(c: &mut Criterion) {
    let mut cms = CountMinSketch::new(128, 4, 7, MergePolicy::Sum).unwrap();
    let mut port: u16 = 0;
    c.bench_function("cms_add", |b| {
        b.iter(|| {
            port = port.wrapping_add(1);
            cms.add(black_box(&port.to_be_bytes()), 1);
        })
    });
}

fn bench_endpoint_observe_and_serialize(c: &mut Criterion) {
    let config = SketchConfig::default();
    let id = EndpointId::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
    let mut source = SyntheticSource::new(&SyntheticConfig::default(), 0);
    let records = source.batch(1024);
    let mut sketch = EndpointSketch::new(id, &config, 0).unwrap();

    c.bench_function("endpoint_observe", |b| {
        let mut i = 0;
        b.iter(|| {
            sketch.observe(black_box(&records[i % records.len()]));
            i += 1;
        })
    });

    c.bench_function("endpoint_serialize", |b| b.iter(|| black_box(sketch.serialize())));
}

criterion_group!(benches, bench_hll_add, bench_cms_add, bench_endpoint_observe_and_serialize);
criterion_main!(benches);

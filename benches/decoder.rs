//! Decoder benchmark: one IPFIX packet of synthetic records per iteration.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use flowprint_edge::config::SyntheticConfig;
use flowprint_edge::flow::{FlowDecoder, SyntheticSource, TemplateManager};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

const RECORDS: usize = 200;

fn bench_decode_packet(c: &mut Criterion) {
    let decoder = FlowDecoder::new(Arc::new(TemplateManager::new(64)));
    let exporter = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let packet = SyntheticSource::new(&SyntheticConfig::default(), 0).packet(RECORDS);

    let mut group = c.benchmark_group("decoder");
    group.throughput(Throughput::Elements(RECORDS as u64));
    group.bench_function("decode_with", |b| {
        b.iter(|| {
            let mut ports = 0u64;
            let report = decoder
                .decode_with(black_box(&packet), exporter, |r| ports += u64::from(r.dst_port))
                .unwrap();
            black_box((report.records, ports))
        })
    });
    group.bench_function("decode_owned", |b| {
        b.iter(|| black_box(decoder.decode(black_box(&packet), exporter).unwrap()))
    });
    group.finish();
}

criterion_group!(benches, bench_decode_packet);
criterion_main!(benches);

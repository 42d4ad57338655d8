//! Seeded flow-record generator for simulation without live exporters.

use crate::config::SyntheticConfig;
use crate::flow::encode::PacketBuilder;
use crate::flow::record::{FieldType, FlowRecord, MacAddr};
use crate::flow::template::FieldSpec;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::net::{IpAddr, Ipv4Addr};

pub const SYNTHETIC_TEMPLATE_ID: u16 = 256;
pub const SYNTHETIC_DOMAIN_ID: u32 = 1;

const TCP: u8 = 6;
const UDP: u8 = 17;

/// (destination port, protocol, relative weight)
const SERVICES: &[(u16, u8, u32)] = &[
    (443, TCP, 40),
    (80, TCP, 15),
    (53, UDP, 20),
    (123, UDP, 5),
    (22, TCP, 5),
    (8080, TCP, 5),
    (5353, UDP, 5),
    (1883, TCP, 5),
];

/// Layout of the IPFIX template the generator announces in [`SyntheticSource::packet`].
pub fn template_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::new(FieldType::Ipv4SrcAddr.id(), 4),
        FieldSpec::new(FieldType::Ipv4DstAddr.id(), 4),
        FieldSpec::new(FieldType::L4SrcPort.id(), 2),
        FieldSpec::new(FieldType::L4DstPort.id(), 2),
        FieldSpec::new(FieldType::Protocol.id(), 1),
        FieldSpec::new(FieldType::InBytes.id(), 8),
        FieldSpec::new(FieldType::InPkts.id(), 8),
        FieldSpec::new(FieldType::SrcMac.id(), 6),
        FieldSpec::new(FieldType::FlowStartMilliseconds.id(), 8),
        FieldSpec::new(FieldType::FlowEndMilliseconds.id(), 8),
    ]
}

struct SyntheticEndpoint {
    addr: Ipv4Addr,
    mac: MacAddr,
}

pub struct SyntheticSource {
    rng: StdRng,
    endpoints: Vec<SyntheticEndpoint>,
    peers: u32,
    clock_ms: i64,
    sequence: u32,
}

impl SyntheticSource {
    pub fn new(config: &SyntheticConfig, start_ms: i64) -> Self {
        let endpoints = (0..config.endpoints.max(1))
            .map(|i| {
                let [_, _, hi, lo] = i.to_be_bytes();
                SyntheticEndpoint {
                    addr: Ipv4Addr::new(10, 0, hi, lo),
                    mac: [0x02, 0x00, 0x00, 0x00, hi, lo],
                }
            })
            .collect();
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            endpoints,
            peers: config.peers.max(1),
            clock_ms: start_ms,
            sequence: 0,
        }
    }

    pub fn next_record(&mut self) -> FlowRecord {
        self.clock_ms += self.rng.gen_range(0..50);
        let idx = self.rng.gen_range(0..self.endpoints.len());
        let (dst_port, protocol, _) = SERVICES
            .choose_weighted(&mut self.rng, |s| s.2)
            .copied()
            .unwrap_or(SERVICES[0]);
        let peer = self.rng.gen_range(0..self.peers);
        let [_, _, hi, lo] = peer.to_be_bytes();
        let packets = self.rng.gen_range(1..200u64);
        let duration = self.rng.gen_range(0..30_000i64);

        let ep = &self.endpoints[idx];
        FlowRecord {
            src_addr: Some(IpAddr::V4(ep.addr)),
            dst_addr: Some(IpAddr::V4(Ipv4Addr::new(172, 16, hi, lo))),
            src_port: self.rng.gen_range(32768..61000),
            dst_port,
            protocol,
            bytes: packets * self.rng.gen_range(60..1500u64),
            packets,
            src_mac: Some(ep.mac),
            flow_start_ms: Some((self.clock_ms - duration).max(0) as u64),
            flow_end_ms: Some(self.clock_ms.max(0) as u64),
            export_ms: self.clock_ms,
            ..FlowRecord::default()
        }
    }

    pub fn batch(&mut self, n: usize) -> Vec<FlowRecord> {
        (0..n).map(|_| self.next_record()).collect()
    }

    /// An IPFIX packet announcing the synthetic template followed by `n` records.
    pub fn packet(&mut self, n: usize) -> Bytes {
        let records = self.batch(n);
        let fields = template_fields();
        self.sequence = self.sequence.wrapping_add(n as u32);
        let mut builder = PacketBuilder::ipfix(SYNTHETIC_DOMAIN_ID)
            .export_secs((self.clock_ms / 1000).max(0) as u32)
            .sequence(self.sequence);
        builder
            .template(SYNTHETIC_TEMPLATE_ID, &fields)
            .data(SYNTHETIC_TEMPLATE_ID, &fields, &records);
        builder.build()
    }
}

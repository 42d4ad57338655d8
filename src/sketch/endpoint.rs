//! Per-endpoint behavioral fingerprint: distinct peers, destination-port and protocol
//! distributions, and a few exact counters.
//!
//! Serialized layout (big-endian):
//! ```text
//! 0   magic "FPSK"        4
//! 4   format version      1
//! 5   merge policy        1
//! 6   endpoint tag        1   (0 mac, 4 ipv4, 6 ipv6)
//! 7   endpoint address    16  (zero padded)
//! 23  precision p         1
//! 24  depth               2
//! 26  width               4
//! 30  seed                8
//! 38  window start ms     8
//! 46  window end ms       8
//! 54  first seen ms       8
//! 62  last seen ms        8
//! 70  flow count          8
//! 78  byte count          8
//! 86  packet count        8
//! 94  registers           2^p
//!     dst ports total     8, then depth * width u32 cells
//!     protocols total     8, then depth * width u32 cells
//! ```

use crate::config::SketchConfig;
use crate::error::SketchError;
use crate::flow::{EndpointId, FlowRecord};
use crate::sketch::cardinality::HyperLogLog;
use crate::sketch::frequency::{CountMinSketch, MergePolicy};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::IpAddr;

pub const SKETCH_MAGIC: [u8; 4] = *b"FPSK";
pub const FORMAT_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 94;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSketch {
    id: EndpointId,
    config: SketchConfig,
    peers: HyperLogLog,
    dst_ports: CountMinSketch,
    protocols: CountMinSketch,
    window_start_ms: i64,
    window_end_ms: i64,
    /// `i64::MAX` until the first flow is observed.
    first_seen_ms: i64,
    /// `i64::MIN` until the first flow is observed.
    last_seen_ms: i64,
    flow_count: u64,
    byte_count: u64,
    packet_count: u64,
}

impl EndpointSketch {
    pub fn new(id: EndpointId, config: &SketchConfig, window_start_ms: i64) -> Result<Self, SketchError> {
        config.validate()?;
        let cms = || CountMinSketch::new(config.width, config.depth, config.seed, config.merge_policy);
        Ok(Self {
            id,
            config: *config,
            peers: HyperLogLog::new(config.precision, config.seed)?,
            dst_ports: cms()?,
            protocols: cms()?,
            window_start_ms,
            window_end_ms: window_start_ms,
            first_seen_ms: i64::MAX,
            last_seen_ms: i64::MIN,
            flow_count: 0,
            byte_count: 0,
            packet_count: 0,
        })
    }

    /// Reuse an empty sketch for another endpoint.
    pub(crate) fn rebind(mut self, id: EndpointId, window_start_ms: i64) -> Self {
        self.id = id;
        self.window_start_ms = window_start_ms;
        self.window_end_ms = window_start_ms;
        self
    }

    pub fn observe(&mut self, record: &FlowRecord) {
        self.first_seen_ms = self.first_seen_ms.min(record.first_ms());
        self.last_seen_ms = self.last_seen_ms.max(record.last_ms());
        self.flow_count = self.flow_count.saturating_add(1);
        self.byte_count = self.byte_count.saturating_add(record.bytes);
        self.packet_count = self.packet_count.saturating_add(record.packets);

        match record.dst_addr {
            Some(IpAddr::V4(v4)) => self.peers.add(&v4.octets()),
            Some(IpAddr::V6(v6)) => self.peers.add(&v6.octets()),
            None => {}
        }
        self.dst_ports.add(&record.dst_port.to_be_bytes(), 1);
        self.protocols.add(&[record.protocol], 1);
    }

    /// Combine another fingerprint of the same endpoint (e.g. seen by another exporter).
    /// Neither side changes unless every component is compatible.
    pub fn merge(&mut self, other: &EndpointSketch) -> Result<(), SketchError> {
        if self.id != other.id {
            return Err(SketchError::IncompatibleSketch(format!(
                "endpoint {} vs {}",
                self.id, other.id
            )));
        }
        if self.config != other.config {
            return Err(SketchError::IncompatibleSketch(
                "sketch configuration differs".to_string(),
            ));
        }
        self.peers.check_compatible(&other.peers)?;
        self.dst_ports.check_compatible(&other.dst_ports)?;
        self.protocols.check_compatible(&other.protocols)?;

        self.peers.merge(&other.peers)?;
        self.dst_ports.merge(&other.dst_ports)?;
        self.protocols.merge(&other.protocols)?;

        // Exact counters always sum; the merge policy only governs frequency cells.
        self.flow_count = self.flow_count.saturating_add(other.flow_count);
        self.byte_count = self.byte_count.saturating_add(other.byte_count);
        self.packet_count = self.packet_count.saturating_add(other.packet_count);
        self.first_seen_ms = self.first_seen_ms.min(other.first_seen_ms);
        self.last_seen_ms = self.last_seen_ms.max(other.last_seen_ms);
        self.window_start_ms = self.window_start_ms.min(other.window_start_ms);
        self.window_end_ms = self.window_end_ms.max(other.window_end_ms);
        Ok(())
    }

    /// Close the current window at `at_ms` ahead of serialization.
    pub fn seal(&mut self, at_ms: i64) {
        self.window_end_ms = self.window_end_ms.max(at_ms);
    }

    /// Start a new window for the exact counters; probabilistic state is kept.
    pub fn reset_counters(&mut self, at_ms: i64) {
        self.flow_count = 0;
        self.byte_count = 0;
        self.packet_count = 0;
        self.window_start_ms = at_ms;
        self.window_end_ms = at_ms;
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn config(&self) -> &SketchConfig {
        &self.config
    }

    pub fn peers(&self) -> &HyperLogLog {
        &self.peers
    }

    pub fn dst_ports(&self) -> &CountMinSketch {
        &self.dst_ports
    }

    pub fn protocols(&self) -> &CountMinSketch {
        &self.protocols
    }

    pub fn distinct_peers(&self) -> f64 {
        self.peers.estimate()
    }

    pub fn port_estimate(&self, port: u16) -> u32 {
        self.dst_ports.estimate(&port.to_be_bytes())
    }

    pub fn protocol_estimate(&self, protocol: u8) -> u32 {
        self.protocols.estimate(&[protocol])
    }

    pub fn window(&self) -> (i64, i64) {
        (self.window_start_ms, self.window_end_ms)
    }

    pub fn first_seen_ms(&self) -> i64 {
        self.first_seen_ms
    }

    pub fn last_seen_ms(&self) -> i64 {
        self.last_seen_ms
    }

    pub fn flow_count(&self) -> u64 {
        self.flow_count
    }

    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn serialized_len(&self) -> usize {
        HEADER_LEN + self.peers.num_registers() + 2 * (8 + self.dst_ports.counters().len() * 4)
    }

    pub fn serialize(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.serialized_len());
        let (tag, addr) = self.id.to_wire();
        out.put_slice(&SKETCH_MAGIC);
        out.put_u8(FORMAT_VERSION);
        out.put_u8(self.config.merge_policy.to_wire());
        out.put_u8(tag);
        out.put_slice(&addr);
        out.put_u8(self.config.precision);
        out.put_u16(self.config.depth);
        out.put_u32(self.config.width);
        out.put_u64(self.config.seed);
        out.put_i64(self.window_start_ms);
        out.put_i64(self.window_end_ms);
        out.put_i64(self.first_seen_ms);
        out.put_i64(self.last_seen_ms);
        out.put_u64(self.flow_count);
        out.put_u64(self.byte_count);
        out.put_u64(self.packet_count);
        out.put_slice(self.peers.registers());
        for cms in [&self.dst_ports, &self.protocols] {
            out.put_u64(cms.total());
            for c in cms.counters() {
                out.put_u32(*c);
            }
        }
        out.freeze()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, SketchError> {
        if bytes.len() < HEADER_LEN {
            return Err(SketchError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }
        let mut cur = bytes;
        let mut magic = [0u8; 4];
        cur.copy_to_slice(&mut magic);
        if magic != SKETCH_MAGIC {
            return Err(SketchError::Corrupt("bad magic".to_string()));
        }
        let version = cur.get_u8();
        if version != FORMAT_VERSION {
            return Err(SketchError::Corrupt(format!("unsupported format version {}", version)));
        }
        let merge_policy = MergePolicy::from_wire(cur.get_u8())
            .ok_or_else(|| SketchError::Corrupt("unknown merge policy".to_string()))?;
        let tag = cur.get_u8();
        let mut addr = [0u8; 16];
        cur.copy_to_slice(&mut addr);
        let id = EndpointId::from_wire(tag, addr)
            .ok_or_else(|| SketchError::Corrupt(format!("unknown endpoint tag {}", tag)))?;
        let config = SketchConfig {
            precision: cur.get_u8(),
            depth: cur.get_u16(),
            width: cur.get_u32(),
            seed: cur.get_u64(),
            merge_policy,
        };
        config.validate()?;
        // Size the payload from the header before allocating anything it declares.
        let needed = encoded_len(&config)
            .ok_or_else(|| SketchError::Corrupt("declared dimensions overflow".to_string()))?;
        if bytes.len() < needed {
            return Err(SketchError::Truncated {
                needed,
                available: bytes.len(),
            });
        }
        if bytes.len() > needed {
            return Err(SketchError::Corrupt(format!(
                "{} trailing bytes",
                bytes.len() - needed
            )));
        }

        let mut sketch = EndpointSketch::new(id, &config, cur.get_i64())?;
        sketch.window_end_ms = cur.get_i64();
        sketch.first_seen_ms = cur.get_i64();
        sketch.last_seen_ms = cur.get_i64();
        sketch.flow_count = cur.get_u64();
        sketch.byte_count = cur.get_u64();
        sketch.packet_count = cur.get_u64();

        let m = sketch.peers.num_registers();
        sketch.peers = HyperLogLog::from_registers(config.precision, config.seed, &cur[..m])?;
        cur.advance(m);

        let cells = config.width as usize * usize::from(config.depth);
        let read_cms = |cur: &mut &[u8]| {
            let total = cur.get_u64();
            let counters: Vec<u32> = (0..cells).map(|_| cur.get_u32()).collect();
            CountMinSketch::from_parts(config.width, config.depth, config.seed, merge_policy, counters, total)
        };
        sketch.dst_ports = read_cms(&mut cur)?;
        sketch.protocols = read_cms(&mut cur)?;
        Ok(sketch)
    }
}

/// Serialized size for `config`, or `None` if it does not fit in `usize`.
fn encoded_len(config: &SketchConfig) -> Option<usize> {
    let registers = 1usize.checked_shl(u32::from(config.precision))?;
    let cells = usize::try_from(config.width)
        .ok()?
        .checked_mul(usize::from(config.depth))?;
    let cms = cells.checked_mul(4)?.checked_add(8)?;
    HEADER_LEN.checked_add(registers)?.checked_add(cms.checked_mul(2)?)
}

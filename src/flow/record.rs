//! Decoded flow records, the supported field dictionary, and exporter/endpoint identities.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub type MacAddr = [u8; 6];

/// Information elements the decoder maps onto typed [`FlowRecord`] fields.
/// Numbering follows the shared NetFlow v9 / IANA IPFIX registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    InBytes,
    InPkts,
    Protocol,
    Tos,
    TcpFlags,
    L4SrcPort,
    Ipv4SrcAddr,
    InputSnmp,
    L4DstPort,
    Ipv4DstAddr,
    OutputSnmp,
    LastSwitched,
    FirstSwitched,
    Ipv6SrcAddr,
    Ipv6DstAddr,
    SrcMac,
    DstMac,
    FlowStartSeconds,
    FlowEndSeconds,
    FlowStartMilliseconds,
    FlowEndMilliseconds,
    Other(u16),
}

impl FieldType {
    pub fn from_id(id: u16) -> Self {
        match id {
            1 => FieldType::InBytes,
            2 => FieldType::InPkts,
            4 => FieldType::Protocol,
            5 => FieldType::Tos,
            6 => FieldType::TcpFlags,
            7 => FieldType::L4SrcPort,
            8 => FieldType::Ipv4SrcAddr,
            10 => FieldType::InputSnmp,
            11 => FieldType::L4DstPort,
            12 => FieldType::Ipv4DstAddr,
            14 => FieldType::OutputSnmp,
            21 => FieldType::LastSwitched,
            22 => FieldType::FirstSwitched,
            27 => FieldType::Ipv6SrcAddr,
            28 => FieldType::Ipv6DstAddr,
            56 => FieldType::SrcMac,
            80 => FieldType::DstMac,
            150 => FieldType::FlowStartSeconds,
            151 => FieldType::FlowEndSeconds,
            152 => FieldType::FlowStartMilliseconds,
            153 => FieldType::FlowEndMilliseconds,
            other => FieldType::Other(other),
        }
    }

    pub fn id(self) -> u16 {
        match self {
            FieldType::InBytes => 1,
            FieldType::InPkts => 2,
            FieldType::Protocol => 4,
            FieldType::Tos => 5,
            FieldType::TcpFlags => 6,
            FieldType::L4SrcPort => 7,
            FieldType::Ipv4SrcAddr => 8,
            FieldType::InputSnmp => 10,
            FieldType::L4DstPort => 11,
            FieldType::Ipv4DstAddr => 12,
            FieldType::OutputSnmp => 14,
            FieldType::LastSwitched => 21,
            FieldType::FirstSwitched => 22,
            FieldType::Ipv6SrcAddr => 27,
            FieldType::Ipv6DstAddr => 28,
            FieldType::SrcMac => 56,
            FieldType::DstMac => 80,
            FieldType::FlowStartSeconds => 150,
            FieldType::FlowEndSeconds => 151,
            FieldType::FlowStartMilliseconds => 152,
            FieldType::FlowEndMilliseconds => 153,
            FieldType::Other(id) => id,
        }
    }
}

/// Device exporting flow telemetry. Templates are scoped to one exporter and
/// observation domain (v9 source id / IPFIX observation domain id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExporterId {
    pub addr: IpAddr,
    pub domain_id: u32,
}

impl ExporterId {
    pub fn new(addr: IpAddr, domain_id: u32) -> Self {
        Self { addr, domain_id }
    }
}

impl fmt::Display for ExporterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.domain_id)
    }
}

/// Stable key for one observed network endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EndpointId {
    Mac(MacAddr),
    Ip(IpAddr),
}

const ENDPOINT_TAG_MAC: u8 = 0;
const ENDPOINT_TAG_V4: u8 = 4;
const ENDPOINT_TAG_V6: u8 = 6;

impl EndpointId {
    /// Fixed 17-byte wire form: tag byte followed by the address, zero padded.
    pub(crate) fn to_wire(self) -> (u8, [u8; 16]) {
        let mut out = [0u8; 16];
        match self {
            EndpointId::Mac(mac) => {
                out[..6].copy_from_slice(&mac);
                (ENDPOINT_TAG_MAC, out)
            }
            EndpointId::Ip(IpAddr::V4(v4)) => {
                out[..4].copy_from_slice(&v4.octets());
                (ENDPOINT_TAG_V4, out)
            }
            EndpointId::Ip(IpAddr::V6(v6)) => (ENDPOINT_TAG_V6, v6.octets()),
        }
    }

    pub(crate) fn from_wire(tag: u8, raw: [u8; 16]) -> Option<Self> {
        match tag {
            ENDPOINT_TAG_MAC => {
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&raw[..6]);
                Some(EndpointId::Mac(mac))
            }
            ENDPOINT_TAG_V4 => Some(EndpointId::Ip(IpAddr::V4(Ipv4Addr::new(
                raw[0], raw[1], raw[2], raw[3],
            )))),
            ENDPOINT_TAG_V6 => Some(EndpointId::Ip(IpAddr::V6(Ipv6Addr::from(raw)))),
            _ => None,
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Mac(m) => write!(
                f,
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                m[0], m[1], m[2], m[3], m[4], m[5]
            ),
            EndpointId::Ip(ip) => write!(f, "{}", ip),
        }
    }
}

/// Which record field identifies the endpoint a flow belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKey {
    SourceMac,
    #[default]
    SourceIp,
}

/// Field the decoder could not map to a typed slot (vendor extension, enterprise
/// element, or an unexpected width). Shares the packet buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawField {
    pub field_type: u16,
    pub enterprise: Option<u32>,
    pub value: Bytes,
}

/// One decoded flow. The decoder reuses a single instance across the records of a
/// packet; call [`FlowRecord::clear`] before refilling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowRecord {
    pub src_addr: Option<IpAddr>,
    pub dst_addr: Option<IpAddr>,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub tos: u8,
    pub tcp_flags: u8,
    pub bytes: u64,
    pub packets: u64,
    pub src_mac: Option<MacAddr>,
    pub dst_mac: Option<MacAddr>,
    pub input_snmp: u32,
    pub output_snmp: u32,
    /// v9 sysUptime-relative milliseconds.
    pub first_switched: Option<u32>,
    pub last_switched: Option<u32>,
    /// Absolute epoch milliseconds (IPFIX).
    pub flow_start_ms: Option<u64>,
    pub flow_end_ms: Option<u64>,
    /// Packet header context used to resolve relative timestamps.
    pub export_ms: i64,
    pub sys_uptime_ms: u32,
    pub unknown: Vec<RawField>,
}

fn read_uint(value: &[u8]) -> u64 {
    value.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn put_uint(out: &mut BytesMut, v: u64, len: usize) {
    if len > 8 {
        out.put_bytes(0, len - 8);
        out.put_u64(v);
    } else {
        out.put_uint(v, len);
    }
}

impl FlowRecord {
    pub fn clear(&mut self) {
        let mut unknown = std::mem::take(&mut self.unknown);
        unknown.clear();
        *self = FlowRecord {
            unknown,
            ..FlowRecord::default()
        };
    }

    /// Apply one template field. `value` is a slice of the packet buffer.
    pub(crate) fn set_field(&mut self, field_type: u16, enterprise: Option<u32>, value: Bytes) {
        if enterprise.is_none() && self.set_known(FieldType::from_id(field_type), &value) {
            return;
        }
        self.unknown.push(RawField {
            field_type,
            enterprise,
            value,
        });
    }

    fn set_known(&mut self, ft: FieldType, value: &[u8]) -> bool {
        let len = value.len();
        let uint = || (1..=8).contains(&len).then(|| read_uint(value));
        match ft {
            FieldType::InBytes => uint().map(|v| self.bytes = v).is_some(),
            FieldType::InPkts => uint().map(|v| self.packets = v).is_some(),
            FieldType::Protocol => narrow(uint(), |v| self.protocol = v),
            FieldType::Tos => narrow(uint(), |v| self.tos = v),
            FieldType::TcpFlags => narrow(uint(), |v| self.tcp_flags = v),
            FieldType::L4SrcPort => narrow(uint(), |v| self.src_port = v),
            FieldType::L4DstPort => narrow(uint(), |v| self.dst_port = v),
            FieldType::InputSnmp => narrow(uint(), |v| self.input_snmp = v),
            FieldType::OutputSnmp => narrow(uint(), |v| self.output_snmp = v),
            FieldType::FirstSwitched => narrow(uint(), |v| self.first_switched = Some(v)),
            FieldType::LastSwitched => narrow(uint(), |v| self.last_switched = Some(v)),
            FieldType::FlowStartSeconds => uint()
                .and_then(|v| v.checked_mul(1000))
                .map(|v| self.flow_start_ms = Some(v))
                .is_some(),
            FieldType::FlowEndSeconds => uint()
                .and_then(|v| v.checked_mul(1000))
                .map(|v| self.flow_end_ms = Some(v))
                .is_some(),
            FieldType::FlowStartMilliseconds => {
                uint().map(|v| self.flow_start_ms = Some(v)).is_some()
            }
            FieldType::FlowEndMilliseconds => uint().map(|v| self.flow_end_ms = Some(v)).is_some(),
            FieldType::Ipv4SrcAddr | FieldType::Ipv4DstAddr if len == 4 => {
                let addr = IpAddr::V4(Ipv4Addr::new(value[0], value[1], value[2], value[3]));
                if ft == FieldType::Ipv4SrcAddr {
                    self.src_addr = Some(addr);
                } else {
                    self.dst_addr = Some(addr);
                }
                true
            }
            FieldType::Ipv6SrcAddr | FieldType::Ipv6DstAddr if len == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(value);
                let addr = IpAddr::V6(Ipv6Addr::from(octets));
                if ft == FieldType::Ipv6SrcAddr {
                    self.src_addr = Some(addr);
                } else {
                    self.dst_addr = Some(addr);
                }
                true
            }
            FieldType::SrcMac | FieldType::DstMac if len == 6 => {
                let mut mac = [0u8; 6];
                mac.copy_from_slice(value);
                if ft == FieldType::SrcMac {
                    self.src_mac = Some(mac);
                } else {
                    self.dst_mac = Some(mac);
                }
                true
            }
            _ => false,
        }
    }

    /// Write the value of one template field back in its wire width. Inverse of
    /// decoding for every field the template carried.
    pub fn encode_field(&self, field_type: u16, enterprise: Option<u32>, len: usize, out: &mut BytesMut) {
        if let Some(raw) = self
            .unknown
            .iter()
            .find(|r| r.field_type == field_type && r.enterprise == enterprise)
        {
            let n = raw.value.len().min(len);
            out.put_slice(&raw.value[..n]);
            out.put_bytes(0, len - n);
            return;
        }
        let ft = if enterprise.is_some() {
            FieldType::Other(field_type)
        } else {
            FieldType::from_id(field_type)
        };
        let start = out.len();
        match ft {
            FieldType::InBytes => put_uint(out, self.bytes, len),
            FieldType::InPkts => put_uint(out, self.packets, len),
            FieldType::Protocol => put_uint(out, u64::from(self.protocol), len),
            FieldType::Tos => put_uint(out, u64::from(self.tos), len),
            FieldType::TcpFlags => put_uint(out, u64::from(self.tcp_flags), len),
            FieldType::L4SrcPort => put_uint(out, u64::from(self.src_port), len),
            FieldType::L4DstPort => put_uint(out, u64::from(self.dst_port), len),
            FieldType::InputSnmp => put_uint(out, u64::from(self.input_snmp), len),
            FieldType::OutputSnmp => put_uint(out, u64::from(self.output_snmp), len),
            FieldType::FirstSwitched => put_uint(out, u64::from(self.first_switched.unwrap_or(0)), len),
            FieldType::LastSwitched => put_uint(out, u64::from(self.last_switched.unwrap_or(0)), len),
            FieldType::FlowStartSeconds => put_uint(out, self.flow_start_ms.unwrap_or(0) / 1000, len),
            FieldType::FlowEndSeconds => put_uint(out, self.flow_end_ms.unwrap_or(0) / 1000, len),
            FieldType::FlowStartMilliseconds => put_uint(out, self.flow_start_ms.unwrap_or(0), len),
            FieldType::FlowEndMilliseconds => put_uint(out, self.flow_end_ms.unwrap_or(0), len),
            FieldType::Ipv4SrcAddr | FieldType::Ipv6SrcAddr => put_addr(out, self.src_addr),
            FieldType::Ipv4DstAddr | FieldType::Ipv6DstAddr => put_addr(out, self.dst_addr),
            FieldType::SrcMac => out.put_slice(&self.src_mac.unwrap_or_default()),
            FieldType::DstMac => out.put_slice(&self.dst_mac.unwrap_or_default()),
            FieldType::Other(_) => {}
        }
        // Keep the record width fixed whatever the slot held.
        let written = out.len() - start;
        if written < len {
            out.put_bytes(0, len - written);
        } else if written > len {
            out.truncate(start + len);
        }
    }

    /// Flow start in epoch milliseconds, falling back to the export time.
    pub fn first_ms(&self) -> i64 {
        self.flow_start_ms
            .and_then(|v| i64::try_from(v).ok())
            .or_else(|| self.first_switched.map(|s| self.uptime_to_epoch(s)))
            .unwrap_or(self.export_ms)
    }

    /// Flow end in epoch milliseconds, falling back to the export time.
    pub fn last_ms(&self) -> i64 {
        self.flow_end_ms
            .and_then(|v| i64::try_from(v).ok())
            .or_else(|| self.last_switched.map(|s| self.uptime_to_epoch(s)))
            .unwrap_or(self.export_ms)
    }

    fn uptime_to_epoch(&self, switched: u32) -> i64 {
        // sysUptime wraps every ~49.7 days
        let age = self.sys_uptime_ms.wrapping_sub(switched);
        self.export_ms - i64::from(age)
    }

    pub fn endpoint(&self, key: EndpointKey) -> Option<EndpointId> {
        match key {
            EndpointKey::SourceMac => self.src_mac.map(EndpointId::Mac),
            EndpointKey::SourceIp => self.src_addr.map(EndpointId::Ip),
        }
    }
}

fn narrow<T: TryFrom<u64>>(v: Option<u64>, set: impl FnOnce(T)) -> bool {
    match v.and_then(|v| T::try_from(v).ok()) {
        Some(v) => {
            set(v);
            true
        }
        None => false,
    }
}

fn put_addr(out: &mut BytesMut, addr: Option<IpAddr>) {
    match addr {
        Some(IpAddr::V4(v4)) => out.put_slice(&v4.octets()),
        Some(IpAddr::V6(v6)) => out.put_slice(&v6.octets()),
        None => {}
    }
}

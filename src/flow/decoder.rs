//! NetFlow v9 / IPFIX packet decoder.
//!
//! Wire format (both versions, big-endian):
//! ```text
//! v9 header     version(2)=9  count(2)   sys_uptime(4)  unix_secs(4)  sequence(4)  source_id(4)
//! IPFIX header  version(2)=10 length(2)  export_time(4) sequence(4)   domain_id(4)
//! flow-set      set_id(2) length(2) body(length - 4)
//!   v9 set 0 / IPFIX set 2     template records
//!   v9 set 1 / IPFIX set 3     options template records
//!   set id >= 256              data records laid out by template `set_id`
//! ```
//! A bad flow-set is reported in the [`DecodeReport`] and decoding moves on to the
//! next one; only an unreadable header fails the whole packet.

use crate::error::{DecodeError, FlowSetIssue, TemplateError};
use crate::flow::record::{ExporterId, FlowRecord};
use crate::flow::template::{FieldSpec, TemplateManager};
use bytes::{Buf, Bytes};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::trace;

pub const NETFLOW_V9: u16 = 9;
pub const IPFIX: u16 = 10;

pub const V9_HEADER_LEN: usize = 20;
pub const IPFIX_HEADER_LEN: usize = 16;
pub const SET_HEADER_LEN: usize = 4;
/// Flow-sets are padded to this boundary.
pub const PADDING_ALIGN: usize = 4;

pub const V9_TEMPLATE_SET: u16 = 0;
pub const V9_OPTIONS_SET: u16 = 1;
pub const IPFIX_TEMPLATE_SET: u16 = 2;
pub const IPFIX_OPTIONS_SET: u16 = 3;

const ENTERPRISE_BIT: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u16,
    /// Record count (v9) or message length (IPFIX).
    pub count_or_length: u16,
    /// Zero for IPFIX, which carries no uptime.
    pub sys_uptime_ms: u32,
    pub export_secs: u32,
    pub sequence: u32,
    pub domain_id: u32,
}

impl PacketHeader {
    pub fn header_len(&self) -> usize {
        if self.version == IPFIX {
            IPFIX_HEADER_LEN
        } else {
            V9_HEADER_LEN
        }
    }

    fn is_ipfix(&self) -> bool {
        self.version == IPFIX
    }
}

/// Outcome of decoding one packet, apart from the records themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeReport {
    pub header: PacketHeader,
    pub flowsets: usize,
    pub records: usize,
    pub templates_registered: usize,
    pub templates_withdrawn: usize,
    /// Options data records recognised and skipped.
    pub options_records: usize,
    pub issues: Vec<FlowSetIssue>,
}

impl DecodeReport {
    fn new(header: PacketHeader) -> Self {
        Self {
            header,
            flowsets: 0,
            records: 0,
            templates_registered: 0,
            templates_withdrawn: 0,
            options_records: 0,
            issues: Vec::new(),
        }
    }

    pub fn malformed_sets(&self) -> usize {
        self.count_issues(|i| matches!(i, FlowSetIssue::MalformedFlowSet { .. }))
    }

    pub fn unknown_template_sets(&self) -> usize {
        self.count_issues(|i| matches!(i, FlowSetIssue::UnknownTemplate { .. }))
    }

    pub fn invalid_templates(&self) -> usize {
        self.count_issues(|i| matches!(i, FlowSetIssue::InvalidTemplate(_)))
    }

    fn count_issues(&self, pred: impl Fn(&FlowSetIssue) -> bool) -> usize {
        self.issues.iter().filter(|i| pred(i)).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    pub records: Vec<FlowRecord>,
    pub report: DecodeReport,
}

pub struct FlowDecoder {
    templates: Arc<TemplateManager>,
}

impl FlowDecoder {
    pub fn new(templates: Arc<TemplateManager>) -> Self {
        Self { templates }
    }

    pub fn templates(&self) -> &Arc<TemplateManager> {
        &self.templates
    }

    /// Decode a packet into an owned batch of records.
    pub fn decode(&self, packet: &Bytes, exporter: IpAddr) -> Result<DecodedPacket, DecodeError> {
        let mut records = Vec::new();
        let report = self.decode_with(packet, exporter, |r| records.push(r.clone()))?;
        Ok(DecodedPacket { records, report })
    }

    /// Decode a packet, handing each record to `on_record`. The same record buffer is
    /// reused for every call.
    pub fn decode_with<F>(&self, packet: &Bytes, exporter: IpAddr, mut on_record: F) -> Result<DecodeReport, DecodeError>
    where
        F: FnMut(&FlowRecord),
    {
        let header = parse_header(packet)?;
        let exporter = ExporterId::new(exporter, header.domain_id);
        let mut report = DecodeReport::new(header);

        let end = if header.is_ipfix() {
            let declared = usize::from(header.count_or_length);
            if declared > packet.len() {
                return Err(DecodeError::Truncated {
                    needed: declared,
                    available: packet.len(),
                });
            }
            declared.max(IPFIX_HEADER_LEN)
        } else {
            packet.len()
        };

        let mut record = FlowRecord::default();
        let mut offset = header.header_len();
        while end - offset >= SET_HEADER_LEN {
            let mut cur = &packet[offset..end];
            let set_id = cur.get_u16();
            let set_len = usize::from(cur.get_u16());
            if set_len < SET_HEADER_LEN || offset + set_len > end {
                report.issues.push(FlowSetIssue::MalformedFlowSet {
                    set_id,
                    reason: format!("length {} exceeds remaining {} bytes", set_len, end - offset),
                });
                break;
            }
            let body = packet.slice(offset + SET_HEADER_LEN..offset + set_len);
            report.flowsets += 1;

            match (header.is_ipfix(), set_id) {
                (false, V9_TEMPLATE_SET) | (true, IPFIX_TEMPLATE_SET) => {
                    self.parse_template_set(exporter, &header, &body, &mut report)
                }
                (false, V9_OPTIONS_SET) => self.parse_v9_options_set(exporter, &body, &mut report),
                (true, IPFIX_OPTIONS_SET) => self.parse_ipfix_options_set(exporter, &body, &mut report),
                _ => self.parse_data_set(exporter, &header, set_id, &body, &mut record, &mut on_record, &mut report),
            }
            offset += set_len;
        }

        trace!(
            exporter = %exporter,
            records = report.records,
            issues = report.issues.len(),
            "packet decoded"
        );
        Ok(report)
    }

    fn parse_template_set(&self, exporter: ExporterId, header: &PacketHeader, body: &[u8], report: &mut DecodeReport) {
        let mut cur = body;
        while cur.remaining() >= 4 {
            let template_id = cur.get_u16();
            let declared = cur.get_u16();
            if header.is_ipfix() && declared == 0 {
                self.withdraw(exporter, template_id, IPFIX_TEMPLATE_SET, report);
                continue;
            }
            let fields = match read_fields(&mut cur, template_id, declared, header.is_ipfix()) {
                Ok(fields) => fields,
                Err(e) => {
                    // Field list overran the set; nothing after it can be trusted.
                    report.issues.push(e.into());
                    return;
                }
            };
            match self.templates.register_template(exporter, template_id, fields) {
                Ok(_) => report.templates_registered += 1,
                Err(e) => report.issues.push(e.into()),
            }
        }
    }

    fn parse_v9_options_set(&self, exporter: ExporterId, body: &[u8], report: &mut DecodeReport) {
        let mut cur = body;
        while cur.remaining() >= 6 {
            let template_id = cur.get_u16();
            let scope_len = cur.get_u16();
            let option_len = cur.get_u16();
            if scope_len % 4 != 0 || option_len % 4 != 0 {
                report.issues.push(FlowSetIssue::MalformedFlowSet {
                    set_id: V9_OPTIONS_SET,
                    reason: format!("options template {} has unaligned lengths", template_id),
                });
                return;
            }
            let scope_fields = scope_len / 4;
            let declared = scope_fields + option_len / 4;
            let fields = match read_fields(&mut cur, template_id, declared, false) {
                Ok(fields) => fields,
                Err(e) => {
                    report.issues.push(e.into());
                    return;
                }
            };
            match self
                .templates
                .register_options_template(exporter, template_id, scope_fields, fields)
            {
                Ok(_) => report.templates_registered += 1,
                Err(e) => report.issues.push(e.into()),
            }
        }
    }

    fn parse_ipfix_options_set(&self, exporter: ExporterId, body: &[u8], report: &mut DecodeReport) {
        let mut cur = body;
        while cur.remaining() >= 4 {
            let template_id = cur.get_u16();
            let declared = cur.get_u16();
            if declared == 0 {
                self.withdraw(exporter, template_id, IPFIX_OPTIONS_SET, report);
                continue;
            }
            if cur.remaining() < 2 {
                report.issues.push(
                    TemplateError::FieldCountMismatch {
                        template_id,
                        declared,
                        parsed: 0,
                    }
                    .into(),
                );
                return;
            }
            let scope_fields = cur.get_u16();
            let fields = match read_fields(&mut cur, template_id, declared, true) {
                Ok(fields) => fields,
                Err(e) => {
                    report.issues.push(e.into());
                    return;
                }
            };
            match self
                .templates
                .register_options_template(exporter, template_id, scope_fields, fields)
            {
                Ok(_) => report.templates_registered += 1,
                Err(e) => report.issues.push(e.into()),
            }
        }
    }

    fn withdraw(&self, exporter: ExporterId, template_id: u16, set_id: u16, report: &mut DecodeReport) {
        // Withdrawing the set id itself withdraws every template of that set's kind.
        if template_id == set_id {
            report.templates_withdrawn += self
                .templates
                .withdraw_all(exporter, set_id == IPFIX_OPTIONS_SET);
        } else if self.templates.withdraw(exporter, template_id) {
            report.templates_withdrawn += 1;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_data_set<F>(
        &self,
        exporter: ExporterId,
        header: &PacketHeader,
        set_id: u16,
        body: &Bytes,
        record: &mut FlowRecord,
        on_record: &mut F,
        report: &mut DecodeReport,
    ) where
        F: FnMut(&FlowRecord),
    {
        let Some(template) = self.templates.get_template(exporter, set_id) else {
            report.issues.push(FlowSetIssue::UnknownTemplate { template_id: set_id });
            return;
        };
        let width = template.record_len();
        let count = body.len() / width;
        let rem = body.len() % width;
        let padded = rem < PADDING_ALIGN && (body.len() + SET_HEADER_LEN) % PADDING_ALIGN == 0;
        if rem != 0 && !padded {
            report.issues.push(FlowSetIssue::MalformedFlowSet {
                set_id,
                reason: format!("{} body bytes is not a multiple of record width {}", body.len(), width),
            });
            return;
        }
        if template.is_options() {
            report.options_records += count;
            return;
        }

        let export_ms = i64::from(header.export_secs) * 1000;
        for i in 0..count {
            record.clear();
            record.export_ms = export_ms;
            record.sys_uptime_ms = header.sys_uptime_ms;
            let mut pos = i * width;
            for f in &template.fields {
                let len = usize::from(f.length);
                record.set_field(f.field_type, f.enterprise, body.slice(pos..pos + len));
                pos += len;
            }
            on_record(record);
            report.records += 1;
        }
    }
}

/// Read the fixed header. Fails on short input or an unsupported version.
pub fn parse_header(packet: &[u8]) -> Result<PacketHeader, DecodeError> {
    let mut cur = packet;
    if cur.remaining() < 2 {
        return Err(DecodeError::Truncated {
            needed: 2,
            available: packet.len(),
        });
    }
    let version = cur.get_u16();
    let needed = match version {
        NETFLOW_V9 => V9_HEADER_LEN,
        IPFIX => IPFIX_HEADER_LEN,
        other => return Err(DecodeError::UnsupportedVersion(other)),
    };
    if packet.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: packet.len(),
        });
    }
    let count_or_length = cur.get_u16();
    if version == NETFLOW_V9 {
        let sys_uptime_ms = cur.get_u32();
        let export_secs = cur.get_u32();
        let sequence = cur.get_u32();
        let domain_id = cur.get_u32();
        Ok(PacketHeader {
            version,
            count_or_length,
            sys_uptime_ms,
            export_secs,
            sequence,
            domain_id,
        })
    } else {
        let export_secs = cur.get_u32();
        let sequence = cur.get_u32();
        let domain_id = cur.get_u32();
        Ok(PacketHeader {
            version,
            count_or_length,
            sys_uptime_ms: 0,
            export_secs,
            sequence,
            domain_id,
        })
    }
}

fn read_fields(cur: &mut &[u8], template_id: u16, declared: u16, ipfix: bool) -> Result<Vec<FieldSpec>, TemplateError> {
    let mismatch = |parsed: u16| TemplateError::FieldCountMismatch {
        template_id,
        declared,
        parsed,
    };
    let mut fields = Vec::with_capacity(usize::from(declared));
    for parsed in 0..declared {
        if cur.remaining() < 4 {
            return Err(mismatch(parsed));
        }
        let raw_type = cur.get_u16();
        let length = cur.get_u16();
        let mut spec = FieldSpec::new(raw_type, length);
        if ipfix && raw_type & ENTERPRISE_BIT != 0 {
            if cur.remaining() < 4 {
                return Err(mismatch(parsed));
            }
            spec.field_type = raw_type & !ENTERPRISE_BIT;
            spec.enterprise = Some(cur.get_u32());
        }
        fields.push(spec);
    }
    Ok(fields)
}

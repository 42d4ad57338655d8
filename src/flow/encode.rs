//! Packet builder for NetFlow v9 / IPFIX. Used by the synthetic source and in tests to
//! produce packets the decoder understands.

use crate::flow::decoder::{
    IPFIX, IPFIX_HEADER_LEN, IPFIX_OPTIONS_SET, IPFIX_TEMPLATE_SET, NETFLOW_V9, PADDING_ALIGN,
    SET_HEADER_LEN, V9_HEADER_LEN, V9_OPTIONS_SET, V9_TEMPLATE_SET,
};
use crate::flow::record::FlowRecord;
use crate::flow::template::FieldSpec;
use bytes::{BufMut, Bytes, BytesMut};

pub struct PacketBuilder {
    version: u16,
    domain_id: u32,
    sys_uptime_ms: u32,
    export_secs: u32,
    sequence: u32,
    /// v9 header count: template and data records in the packet.
    record_count: u16,
    sets: BytesMut,
}

impl PacketBuilder {
    pub fn v9(source_id: u32) -> Self {
        Self::new(NETFLOW_V9, source_id)
    }

    pub fn ipfix(domain_id: u32) -> Self {
        Self::new(IPFIX, domain_id)
    }

    fn new(version: u16, domain_id: u32) -> Self {
        Self {
            version,
            domain_id,
            sys_uptime_ms: 0,
            export_secs: 0,
            sequence: 0,
            record_count: 0,
            sets: BytesMut::new(),
        }
    }

    pub fn export_secs(mut self, secs: u32) -> Self {
        self.export_secs = secs;
        self
    }

    pub fn sys_uptime_ms(mut self, ms: u32) -> Self {
        self.sys_uptime_ms = ms;
        self
    }

    pub fn sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    fn ipfix_mode(&self) -> bool {
        self.version == IPFIX
    }

    fn put_field_specs(&self, body: &mut BytesMut, fields: &[FieldSpec]) {
        for f in fields {
            match (self.ipfix_mode(), f.enterprise) {
                (true, Some(pen)) => {
                    body.put_u16(f.field_type | 0x8000);
                    body.put_u16(f.length);
                    body.put_u32(pen);
                }
                _ => {
                    body.put_u16(f.field_type);
                    body.put_u16(f.length);
                }
            }
        }
    }

    /// Add a template flow-set announcing one template.
    pub fn template(&mut self, template_id: u16, fields: &[FieldSpec]) -> &mut Self {
        let mut body = BytesMut::new();
        body.put_u16(template_id);
        body.put_u16(fields.len() as u16);
        self.put_field_specs(&mut body, fields);
        let set_id = if self.ipfix_mode() {
            IPFIX_TEMPLATE_SET
        } else {
            V9_TEMPLATE_SET
        };
        self.record_count += 1;
        self.raw_set(set_id, &body)
    }

    /// Add an IPFIX template withdrawal for `template_id`.
    pub fn withdraw(&mut self, template_id: u16) -> &mut Self {
        let mut body = BytesMut::new();
        body.put_u16(template_id);
        body.put_u16(0);
        self.raw_set(IPFIX_TEMPLATE_SET, &body)
    }

    /// Add an IPFIX options template withdrawal for `template_id`.
    pub fn withdraw_options(&mut self, template_id: u16) -> &mut Self {
        let mut body = BytesMut::new();
        body.put_u16(template_id);
        body.put_u16(0);
        self.raw_set(IPFIX_OPTIONS_SET, &body)
    }

    pub fn options_template(&mut self, template_id: u16, scope: &[FieldSpec], options: &[FieldSpec]) -> &mut Self {
        let mut body = BytesMut::new();
        body.put_u16(template_id);
        let set_id = if self.ipfix_mode() {
            body.put_u16((scope.len() + options.len()) as u16);
            body.put_u16(scope.len() as u16);
            IPFIX_OPTIONS_SET
        } else {
            body.put_u16((scope.len() * 4) as u16);
            body.put_u16((options.len() * 4) as u16);
            V9_OPTIONS_SET
        };
        self.put_field_specs(&mut body, scope);
        self.put_field_specs(&mut body, options);
        self.record_count += 1;
        self.raw_set(set_id, &body)
    }

    /// Add a data flow-set encoding `records` with the given layout.
    pub fn data(&mut self, template_id: u16, fields: &[FieldSpec], records: &[FlowRecord]) -> &mut Self {
        let mut body = BytesMut::new();
        for r in records {
            for f in fields {
                r.encode_field(f.field_type, f.enterprise, usize::from(f.length), &mut body);
            }
        }
        self.record_count = self.record_count.saturating_add(records.len() as u16);
        self.raw_set(template_id, &body)
    }

    /// Append a flow-set with an arbitrary body, zero padded to the alignment boundary.
    pub fn raw_set(&mut self, set_id: u16, body: &[u8]) -> &mut Self {
        let unpadded = SET_HEADER_LEN + body.len();
        let padding = (PADDING_ALIGN - unpadded % PADDING_ALIGN) % PADDING_ALIGN;
        self.sets.put_u16(set_id);
        self.sets.put_u16((unpadded + padding) as u16);
        self.sets.put_slice(body);
        self.sets.put_bytes(0, padding);
        self
    }

    pub fn build(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(V9_HEADER_LEN + self.sets.len());
        out.put_u16(self.version);
        if self.ipfix_mode() {
            out.put_u16((IPFIX_HEADER_LEN + self.sets.len()) as u16);
            out.put_u32(self.export_secs);
        } else {
            out.put_u16(self.record_count);
            out.put_u32(self.sys_uptime_ms);
            out.put_u32(self.export_secs);
        }
        out.put_u32(self.sequence);
        out.put_u32(self.domain_id);
        out.put_slice(&self.sets);
        out.freeze()
    }
}

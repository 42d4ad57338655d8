//! Flow telemetry: template tracking, NetFlow v9 / IPFIX decoding, record types,
//! packet building and a synthetic record source.

mod decoder;
mod encode;
mod record;
mod synthetic;
mod template;

pub use decoder::{
    parse_header, DecodeReport, DecodedPacket, FlowDecoder, PacketHeader, IPFIX, NETFLOW_V9,
};
pub use encode::PacketBuilder;
pub use record::{EndpointId, EndpointKey, ExporterId, FieldType, FlowRecord, MacAddr, RawField};
pub use synthetic::{template_fields, SyntheticSource, SYNTHETIC_DOMAIN_ID, SYNTHETIC_TEMPLATE_ID};
pub use template::{FieldSpec, Template, TemplateKind, TemplateManager, MIN_TEMPLATE_ID};

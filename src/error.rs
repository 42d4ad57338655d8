//! Error taxonomy for decoding, sketching, configuration and uplink.
//!
//! Nothing in here is fatal to a running collector except [`ConfigError`], which is
//! only produced at startup.

use thiserror::Error;

/// Packet-level decode failures. The whole packet is dropped and counted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported flow export version {0}")]
    UnsupportedVersion(u16),

    #[error("packet too short: expected at least {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },
}

/// Why a template definition was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template {template_id} has no fields")]
    NoFields { template_id: u16 },

    #[error("template {template_id} field type {field_type} has zero length")]
    ZeroLengthField { template_id: u16, field_type: u16 },

    #[error("template {template_id} field type {field_type} is variable-length")]
    VariableLengthField { template_id: u16, field_type: u16 },

    #[error("template {template_id} declares {declared} fields but only {parsed} fit in the set")]
    FieldCountMismatch {
        template_id: u16,
        declared: u16,
        parsed: u16,
    },

    #[error("template id {0} is reserved for set identifiers")]
    ReservedId(u16),
}

/// Per-flow-set signals. Decoding continues with the next flow-set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowSetIssue {
    #[error("invalid template: {0}")]
    InvalidTemplate(TemplateError),

    #[error("malformed flow-set {set_id}: {reason}")]
    MalformedFlowSet { set_id: u16, reason: String },

    #[error("data flow-set references unknown template {template_id}")]
    UnknownTemplate { template_id: u16 },
}

impl From<TemplateError> for FlowSetIssue {
    fn from(e: TemplateError) -> Self {
        FlowSetIssue::InvalidTemplate(e)
    }
}

/// Sketch construction, merge and wire-format failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SketchError {
    #[error("incompatible sketch: {0}")]
    IncompatibleSketch(String),

    #[error("precision {0} out of range 4..=16")]
    InvalidPrecision(u8),

    #[error("frequency sketch dimensions must be non-zero (width {width}, depth {depth})")]
    InvalidDimensions { width: u32, depth: u16 },

    #[error("serialized sketch too short: expected {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    #[error("corrupt serialized sketch: {0}")]
    Corrupt(String),
}

/// Startup configuration failures. These are the only fatal errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Sketch(#[from] SketchError),
}

/// Backend delivery failures. Always recoverable by retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("uplink timed out after {0} ms")]
    Timeout(u64),

    #[error("uplink request failed: {0}")]
    Request(String),

    #[error("uplink rejected batch: {status} {body}")]
    Status { status: u16, body: String },
}

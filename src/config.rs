//! Edge collector configuration. Loaded once at startup; invalid values are fatal.

use crate::error::{ConfigError, SketchError};
use crate::flow::EndpointKey;
use crate::sketch::{MergePolicy, MAX_PRECISION, MIN_PRECISION};
use crate::store::RetentionPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Identity of this collector, sent with every batch
    pub device_id: String,
    /// Where flow records come from
    pub collector: CollectorConfig,
    /// Template table limits
    pub templates: TemplatesConfig,
    /// Sketch dimensions shared by every endpoint
    pub sketch: SketchConfig,
    /// Endpoint table
    pub store: StoreConfig,
    /// Streaming cycle and retry behaviour
    pub flush: FlushConfig,
    /// Backend uplink
    pub uplink: UplinkConfig,
    /// Logging
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Udp,
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub source: SourceKind,
    /// UDP listen address for NetFlow v9 / IPFIX exporters
    pub bind_addr: String,
    /// Largest datagram accepted
    pub recv_buffer_size: usize,
    pub synthetic: SyntheticConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub endpoints: u32,
    /// Distinct peers each endpoint may contact
    pub peers: u32,
    pub records_per_tick: usize,
    pub tick_ms: u64,
    pub seed: u64,
    /// Encode generated records into IPFIX packets and run them through the decoder
    pub encode_packets: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplatesConfig {
    pub max_per_exporter: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SketchConfig {
    /// Cardinality sketch precision p (m = 2^p registers)
    pub precision: u8,
    /// Frequency sketch columns
    pub width: u32,
    /// Frequency sketch rows
    pub depth: u16,
    /// Hash seed; must match on every side that merges sketches
    pub seed: u64,
    pub merge_policy: MergePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_endpoints: usize,
    pub retention: RetentionPolicy,
    pub endpoint_key: EndpointKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    pub interval_secs: u64,
    /// Batches kept for redelivery while the backend is unreachable
    pub retry_capacity: usize,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub send_timeout_ms: u64,
    /// Budget for the final flush on shutdown
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    /// Without an enabled uplink, batches are logged and discarded
    pub enabled: bool,
    /// Endpoint URL when enabled
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            device_id: "edge-local".to_string(),
            collector: CollectorConfig::default(),
            templates: TemplatesConfig::default(),
            sketch: SketchConfig::default(),
            store: StoreConfig::default(),
            flush: FlushConfig::default(),
            uplink: UplinkConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Udp,
            bind_addr: "0.0.0.0:2055".to_string(),
            recv_buffer_size: 65536,
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            endpoints: 64,
            peers: 512,
            records_per_tick: 200,
            tick_ms: 100,
            seed: 7,
            encode_packets: true,
        }
    }
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            max_per_exporter: 64,
        }
    }
}

impl Default for SketchConfig {
    fn default() -> Self {
        Self {
            precision: 12,
            width: 128,
            depth: 4,
            seed: 0x5EED_F10E,
            merge_policy: MergePolicy::Sum,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_endpoints: 10_000,
            retention: RetentionPolicy::Tumbling,
            endpoint_key: EndpointKey::SourceIp,
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            retry_capacity: 16,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 300_000,
            backoff_multiplier: 2.0,
            send_timeout_ms: 15_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            timeout_secs: 15,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl SketchConfig {
    pub fn validate(&self) -> Result<(), SketchError> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&self.precision) {
            return Err(SketchError::InvalidPrecision(self.precision));
        }
        if self.width == 0 || self.depth == 0 {
            return Err(SketchError::InvalidDimensions {
                width: self.width,
                depth: self.depth,
            });
        }
        Ok(())
    }

    /// Bytes of register and counter state held per endpoint.
    pub fn memory_bytes(&self) -> usize {
        let registers = 1usize << self.precision;
        let counters = self.width as usize * usize::from(self.depth);
        registers + 2 * counters * std::mem::size_of::<u32>()
    }
}

impl EdgeConfig {
    /// Load from JSON file if present; otherwise return defaults. A file that exists but
    /// does not parse or validate is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let config: EdgeConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sketch.validate()?;
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.store.max_endpoints == 0 {
            return invalid("store.max_endpoints must be non-zero");
        }
        if self.templates.max_per_exporter == 0 {
            return invalid("templates.max_per_exporter must be non-zero");
        }
        if self.flush.interval_secs == 0 {
            return invalid("flush.interval_secs must be non-zero");
        }
        if self.flush.retry_capacity == 0 {
            return invalid("flush.retry_capacity must be non-zero");
        }
        if !self.flush.backoff_multiplier.is_finite() || self.flush.backoff_multiplier < 1.0 {
            return invalid("flush.backoff_multiplier must be at least 1");
        }
        if self.flush.backoff_max_ms < self.flush.backoff_initial_ms {
            return invalid("flush.backoff_max_ms must not be below backoff_initial_ms");
        }
        if self.collector.recv_buffer_size == 0 {
            return invalid("collector.recv_buffer_size must be non-zero");
        }
        if self.uplink.enabled && self.uplink.endpoint.as_deref().map_or(true, str::is_empty) {
            return invalid("uplink.enabled requires uplink.endpoint");
        }
        Ok(())
    }
}

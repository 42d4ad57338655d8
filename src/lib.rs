//! flowprint-edge: NetFlow v9 / IPFIX collector that folds flows into per-endpoint
//! behavioral sketches and streams them to a backend.
//!
//! Modules:
//! - [`flow`] — export packet decoding, template cache, packet encoding, synthetic flows
//! - [`sketch`] — HyperLogLog, Count-Min and the per-endpoint fingerprint built from them
//! - [`store`] — capacity-bounded endpoint sketch table
//! - [`orchestrator`] — ingestion, periodic drain, retry buffer and backoff
//! - [`uplink`] — batch transport to the backend
//! - [`collector`] — UDP listener and synthetic feed
//! - [`logging`] — structured JSON logging

pub mod collector;
pub mod config;
pub mod error;
pub mod flow;
pub mod logging;
pub mod orchestrator;
pub mod sketch;
pub mod stats;
pub mod store;
pub mod uplink;

pub use config::EdgeConfig;
pub use flow::{FlowDecoder, FlowRecord, TemplateManager};
pub use logging::StructuredLogger;
pub use orchestrator::{EdgeOrchestrator, FlushReport, OrchestratorState};
pub use sketch::{CountMinSketch, EndpointSketch, HyperLogLog};
pub use store::SketchStore;
pub use uplink::{SketchBatch, Transport, Uplink};

//! Bounded-memory behavioral sketches.
//!
//! - [`HyperLogLog`] — distinct-count estimator (peers contacted)
//! - [`CountMinSketch`] — frequency estimator (ports, protocols)
//! - [`EndpointSketch`] — fixed-size fingerprint composing both per endpoint

mod cardinality;
mod endpoint;
mod frequency;
mod hash;

pub use cardinality::{HyperLogLog, MAX_PRECISION, MIN_PRECISION};
pub use endpoint::{EndpointSketch, FORMAT_VERSION, HEADER_LEN, SKETCH_MAGIC};
pub use frequency::{CountMinSketch, MergePolicy};
pub use hash::{hash_item, ItemHash};

//! In-memory endpoint sketch table.

mod table;

pub use table::{Drain, EncodedSketch, SketchStore};

use serde::{Deserialize, Serialize};

/// What a drain does to the table after serializing each sketch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Every sketch is removed; each window starts from nothing.
    #[default]
    Tumbling,
    /// Nothing is reset; fingerprints accumulate until evicted.
    Cumulative,
    /// Exact counters and the window start are reset; peer/port/protocol sketches keep
    /// accumulating.
    RollingCounters,
}

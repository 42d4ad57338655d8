//! Count-Min frequency sketch with saturating `u32` cells.
//!
//! `depth` rows of `width` counters. Row `i` places an item at
//! `(h1 + i * h2) mod width` (double hashing over one SHA-256 digest). Estimates never
//! undercount; the overcount is at most `e * total / width` with probability
//! `1 - e^-depth`.

use crate::error::SketchError;
use crate::sketch::hash::{hash_item, ItemHash};
use serde::{Deserialize, Serialize};

/// How counters combine when two sketches merge.
///
/// `Sum` adds independently observed traffic, which is what a backend combining
/// different exporters wants; merging overlapping windows twice double counts.
/// `Max` is idempotent but undercounts traffic split across exporters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    #[default]
    Sum,
    Max,
}

impl MergePolicy {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            MergePolicy::Sum => 0,
            MergePolicy::Max => 1,
        }
    }

    pub(crate) fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(MergePolicy::Sum),
            1 => Some(MergePolicy::Max),
            _ => None,
        }
    }

    pub fn combine(self, a: u64, b: u64) -> u64 {
        match self {
            MergePolicy::Sum => a.saturating_add(b),
            MergePolicy::Max => a.max(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountMinSketch {
    width: u32,
    depth: u16,
    seed: u64,
    policy: MergePolicy,
    counters: Box<[u32]>,
    total: u64,
}

impl CountMinSketch {
    pub fn new(width: u32, depth: u16, seed: u64, policy: MergePolicy) -> Result<Self, SketchError> {
        if width == 0 || depth == 0 {
            return Err(SketchError::InvalidDimensions { width, depth });
        }
        let cells = width as usize * usize::from(depth);
        Ok(Self {
            width,
            depth,
            seed,
            policy,
            counters: vec![0u32; cells].into_boxed_slice(),
            total: 0,
        })
    }

    /// Rebuild from serialized counters (row-major).
    pub fn from_parts(
        width: u32,
        depth: u16,
        seed: u64,
        policy: MergePolicy,
        counters: Vec<u32>,
        total: u64,
    ) -> Result<Self, SketchError> {
        let mut sketch = Self::new(width, depth, seed, policy)?;
        if counters.len() != sketch.counters.len() {
            return Err(SketchError::Corrupt(format!(
                "expected {} counters, got {}",
                sketch.counters.len(),
                counters.len()
            )));
        }
        sketch.counters = counters.into_boxed_slice();
        sketch.total = total;
        Ok(sketch)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    /// Total weight added (saturating).
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn counters(&self) -> &[u32] {
        &self.counters
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// `e / width`: the overcount bound as a fraction of [`Self::total`].
    pub fn relative_error(&self) -> f64 {
        std::f64::consts::E / f64::from(self.width)
    }

    fn cells(&self, item: &[u8]) -> impl Iterator<Item = usize> {
        let h = hash_item(self.seed, item);
        let width = u64::from(self.width);
        (0..u64::from(self.depth)).map(move |row| cell_index(h, row, width))
    }

    pub fn add<T: AsRef<[u8]> + ?Sized>(&mut self, item: &T, count: u32) {
        let h = hash_item(self.seed, item.as_ref());
        let width = u64::from(self.width);
        for row in 0..u64::from(self.depth) {
            let cell = &mut self.counters[cell_index(h, row, width)];
            *cell = cell.saturating_add(count);
        }
        self.total = self.total.saturating_add(u64::from(count));
    }

    /// Minimum over the item's cells; never below the true count.
    pub fn estimate<T: AsRef<[u8]> + ?Sized>(&self, item: &T) -> u32 {
        self.cells(item.as_ref())
            .map(|cell| self.counters[cell])
            .min()
            .unwrap_or(0)
    }

    pub fn upper_bound<T: AsRef<[u8]> + ?Sized>(&self, item: &T) -> u64 {
        let slack = (self.relative_error() * self.total as f64) as u64;
        u64::from(self.estimate(item)).saturating_add(slack)
    }

    /// Combine cell-wise per the merge policy. Both sketches are left untouched on error.
    pub fn merge(&mut self, other: &CountMinSketch) -> Result<(), SketchError> {
        self.check_compatible(other)?;
        for (mine, theirs) in self.counters.iter_mut().zip(other.counters.iter()) {
            *mine = match self.policy {
                MergePolicy::Sum => mine.saturating_add(*theirs),
                MergePolicy::Max => (*mine).max(*theirs),
            };
        }
        self.total = self.policy.combine(self.total, other.total);
        Ok(())
    }

    pub(crate) fn check_compatible(&self, other: &CountMinSketch) -> Result<(), SketchError> {
        if self.width != other.width || self.depth != other.depth {
            return Err(SketchError::IncompatibleSketch(format!(
                "frequency shape {}x{} vs {}x{}",
                self.depth, self.width, other.depth, other.width
            )));
        }
        if self.seed != other.seed || self.policy != other.policy {
            return Err(SketchError::IncompatibleSketch(
                "frequency seed or merge policy differs".to_string(),
            ));
        }
        Ok(())
    }
}

fn cell_index(h: ItemHash, row: u64, width: u64) -> usize {
    let col = h.h1.wrapping_add(row.wrapping_mul(h.h2)) % width;
    (row * width + col) as usize
}

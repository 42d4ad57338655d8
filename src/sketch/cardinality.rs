//! HyperLogLog distinct counter.
//!
//! `m = 2^p` one-byte registers. The top `p` bits of the 64-bit item hash pick the
//! register; the register keeps the largest rank (position of the first set bit in the
//! remaining bits) seen so far. Estimation follows Flajolet et al. (2007) with linear
//! counting below `2.5m` and the large-range correction rescaled for a 64-bit hash.

use crate::error::SketchError;
use crate::sketch::hash::hash_item;

pub const MIN_PRECISION: u8 = 4;
pub const MAX_PRECISION: u8 = 16;

const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HyperLogLog {
    precision: u8,
    seed: u64,
    registers: Box<[u8]>,
}

impl HyperLogLog {
    pub fn new(precision: u8, seed: u64) -> Result<Self, SketchError> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            return Err(SketchError::InvalidPrecision(precision));
        }
        Ok(Self {
            precision,
            seed,
            registers: vec![0u8; 1usize << precision].into_boxed_slice(),
        })
    }

    /// Rebuild from serialized registers.
    pub fn from_registers(precision: u8, seed: u64, registers: &[u8]) -> Result<Self, SketchError> {
        let mut hll = Self::new(precision, seed)?;
        if registers.len() != hll.registers.len() {
            return Err(SketchError::Corrupt(format!(
                "expected {} registers, got {}",
                hll.registers.len(),
                registers.len()
            )));
        }
        let max = hll.max_rank();
        if let Some(bad) = registers.iter().find(|r| **r > max) {
            return Err(SketchError::Corrupt(format!("register value {} exceeds {}", bad, max)));
        }
        hll.registers.copy_from_slice(registers);
        Ok(hll)
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn num_registers(&self) -> usize {
        self.registers.len()
    }

    pub fn registers(&self) -> &[u8] {
        &self.registers
    }

    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|r| *r == 0)
    }

    /// Standard error of the estimate, `1.04 / sqrt(m)`.
    pub fn relative_error(&self) -> f64 {
        1.04 / (self.registers.len() as f64).sqrt()
    }

    fn max_rank(&self) -> u8 {
        64 - self.precision + 1
    }

    pub fn add<T: AsRef<[u8]> + ?Sized>(&mut self, item: &T) {
        let hash = hash_item(self.seed, item.as_ref()).h1;
        self.add_hash(hash);
    }

    pub fn add_hash(&mut self, hash: u64) {
        let p = u32::from(self.precision);
        let index = (hash >> (64 - p)) as usize;
        let rest = hash << p;
        let max_rank = self.max_rank();
        let rank = if rest == 0 {
            max_rank
        } else {
            (rest.leading_zeros() as u8 + 1).min(max_rank)
        };
        let slot = &mut self.registers[index];
        if rank > *slot {
            *slot = rank;
        }
    }

    pub fn estimate(&self) -> f64 {
        let m = self.registers.len() as f64;
        let mut sum = 0.0f64;
        let mut zeros = 0usize;
        for r in self.registers.iter() {
            sum += 1.0 / (1u64 << *r) as f64;
            if *r == 0 {
                zeros += 1;
            }
        }
        let raw = alpha(self.registers.len()) * m * m / sum;

        if raw <= 2.5 * m && zeros > 0 {
            m * (m / zeros as f64).ln()
        } else if raw > TWO_POW_64 / 30.0 && raw < TWO_POW_64 {
            -TWO_POW_64 * (1.0 - raw / TWO_POW_64).ln()
        } else {
            raw
        }
    }

    /// Register-wise maximum. Both sketches are left untouched on error.
    pub fn merge(&mut self, other: &HyperLogLog) -> Result<(), SketchError> {
        self.check_compatible(other)?;
        for (mine, theirs) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
        Ok(())
    }

    pub(crate) fn check_compatible(&self, other: &HyperLogLog) -> Result<(), SketchError> {
        if self.precision != other.precision {
            return Err(SketchError::IncompatibleSketch(format!(
                "cardinality precision {} vs {}",
                self.precision, other.precision
            )));
        }
        if self.seed != other.seed {
            return Err(SketchError::IncompatibleSketch(format!(
                "cardinality seed {} vs {}",
                self.seed, other.seed
            )));
        }
        Ok(())
    }
}

fn alpha(m: usize) -> f64 {
    match m {
        16 => 0.673,
        32 => 0.697,
        64 => 0.709,
        _ => 0.7213 / (1.0 + 1.079 / m as f64),
    }
}

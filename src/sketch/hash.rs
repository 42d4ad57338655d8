//! Item hashing shared by every sketch.
//!
//! SHA-256 over `seed (8 bytes LE) || item` so that edge and backend agree on register
//! and cell placement regardless of platform or build.

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemHash {
    pub h1: u64,
    pub h2: u64,
}

pub fn hash_item(seed: u64, item: &[u8]) -> ItemHash {
    let mut h = Sha256::new();
    h.update(seed.to_le_bytes());
    h.update(item);
    let digest = h.finalize();
    ItemHash {
        h1: be_u64(&digest[..8]),
        h2: be_u64(&digest[8..16]),
    }
}

fn be_u64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

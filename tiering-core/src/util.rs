// vim: tw=80
//! Common utility functions used throughout the tiering engine

use metrohash::MetroHash64;
use std::hash::Hasher;

/// Compute the block checksum that the engine verifies on every relocation.
///
/// A block has the same checksum whether it is read as a single buffer or
/// streamed in pieces out of the cache.
pub fn block_checksum<T: AsRef<[u8]>>(sglist: &[T]) -> u64 {
    let mut hasher = MetroHash64::new();
    for buf in sglist {
        hasher.write(buf.as_ref());
    }
    hasher.finish()
}

/// Clamp a possibly out-of-range percentage into `0..=100`.
pub fn clamp_pct(v: i64) -> u8 {
    v.clamp(0, 100) as u8
}

/// What percentage of `whole` is `part`?  Returns 0 for an empty whole.
pub fn percentage(part: u64, whole: u64) -> u8 {
    if whole == 0 {
        0
    } else {
        clamp_pct((part.saturating_mul(100) / whole) as i64)
    }
}

// LCOV_EXCL_STOP

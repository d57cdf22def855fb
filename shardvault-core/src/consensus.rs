//! Consensus tracking and blobber masks
//!
//! Every operation against an allocation fans out to `data + parity` blobbers
//! and needs at least `data` of them to succeed. The `Consensus` tracker
//! counts successes against that threshold; `BlobberMask` records which
//! blobbers are still eligible for the current operation.

use crate::error::{Result, ShardVaultError};
use serde::{Deserialize, Serialize};

/// Maximum number of blobbers per allocation, bounded by the mask width.
pub const MAX_BLOBBERS: usize = 128;

/// Bitset over blobber indices `[0, data_shards + parity_shards)`.
///
/// Bit `i` set means blobber `i` is still eligible for the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobberMask(u128);

impl BlobberMask {
    /// Mask with the low `count` bits set.
    pub fn all(count: usize) -> Self {
        debug_assert!(count <= MAX_BLOBBERS);
        if count == MAX_BLOBBERS {
            Self(u128::MAX)
        } else {
            Self((1u128 << count) - 1)
        }
    }

    /// Empty mask.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Restore a mask from raw bits (progress records).
    pub fn from_bits(bits: u128) -> Self {
        Self(bits)
    }

    /// Raw bits for persistence.
    pub fn bits(&self) -> u128 {
        self.0
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.0 & (1u128 << index) != 0
    }

    pub fn set(&mut self, index: usize) {
        self.0 |= 1u128 << index;
    }

    pub fn clear(&mut self, index: usize) {
        self.0 &= !(1u128 << index);
    }

    /// Number of eligible blobbers.
    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn intersect(&self, other: BlobberMask) -> BlobberMask {
        Self(self.0 & other.0)
    }

    /// Iterate set bit positions in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let bits = self.0;
        (0..MAX_BLOBBERS).filter(move |i| bits & (1u128 << i) != 0)
    }
}

/// Per-request success tracker.
///
/// The threshold is `⌈(data·100)/(data+parity)⌉` percent of `full`, raised to
/// `data` but never above `full`. With `full = data + parity` this is exactly
/// `data`; repair uploads run with a smaller `full` and need every blobber in
/// the restricted set up to `data`.
#[derive(Debug, Clone)]
pub struct Consensus {
    successes: usize,
    threshold: usize,
    full: usize,
}

impl Consensus {
    pub fn new(data_shards: usize, parity_shards: usize) -> Self {
        let full = data_shards + parity_shards;
        Self::with_full(data_shards, parity_shards, full)
    }

    /// Tracker over a restricted blobber set of size `full`. The threshold
    /// stays at `data` where the set allows it, but never exceeds the set
    /// itself, so a single-blobber repair needs exactly that one success.
    pub fn with_full(data_shards: usize, parity_shards: usize, full: usize) -> Self {
        let total = data_shards + parity_shards;
        let rate = (data_shards * 100).div_ceil(total);
        let threshold = (full * rate / 100).max(data_shards).min(full).max(1);
        Self {
            successes: 0,
            threshold,
            full,
        }
    }

    pub fn reset(&mut self) {
        self.successes = 0;
    }

    pub fn add_success(&mut self) {
        self.successes += 1;
    }

    pub fn successes(&self) -> usize {
        self.successes
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn full(&self) -> usize {
        self.full
    }

    pub fn is_met(&self) -> bool {
        self.successes >= self.threshold
    }

    /// Whether the operation can still reach the threshold given the blobbers
    /// remaining in `mask`. Every chunk must gather `threshold` successes, so
    /// the mask itself must keep at least that many bits set.
    pub fn is_viable(&self, mask: &BlobberMask) -> bool {
        mask.count() >= self.threshold
    }

    /// Fail with `ConsensusFailed` unless the threshold was met.
    pub fn check(&self) -> Result<()> {
        if self.is_met() {
            Ok(())
        } else {
            Err(ShardVaultError::ConsensusFailed {
                successes: self.successes,
                threshold: self.threshold,
                full: self.full,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_all() {
        let mask = BlobberMask::all(3);
        assert_eq!(mask.count(), 3);
        assert!(mask.is_set(0) && mask.is_set(1) && mask.is_set(2));
        assert!(!mask.is_set(3));
    }

    #[test]
    fn test_mask_clear_and_iter() {
        let mut mask = BlobberMask::all(5);
        mask.clear(2);
        assert_eq!(mask.count(), 4);
        let bits: Vec<usize> = mask.iter().collect();
        assert_eq!(bits, vec![0, 1, 3, 4]);
    }

    #[test]
    fn test_mask_bits_roundtrip() {
        let mut mask = BlobberMask::all(14);
        mask.clear(0);
        mask.clear(13);
        let restored = BlobberMask::from_bits(mask.bits());
        assert_eq!(mask, restored);
    }

    #[test]
    fn test_mask_intersect() {
        let a = BlobberMask::all(4);
        let mut b = BlobberMask::empty();
        b.set(1);
        b.set(5);
        assert_eq!(a.intersect(b).count(), 1);
        assert!(a.intersect(b).is_set(1));
    }

    #[test]
    fn test_threshold_is_data_shards() {
        // 2+1: ceil(200/3) = 67%, floor(3*67/100) = 2
        assert_eq!(Consensus::new(2, 1).threshold(), 2);
        // 10+4: ceil(1000/14) = 72%, floor(14*72/100) = 10
        assert_eq!(Consensus::new(10, 4).threshold(), 10);
        // no parity: all blobbers must succeed
        assert_eq!(Consensus::new(3, 0).threshold(), 3);
    }

    #[test]
    fn test_threshold_restricted_full_never_below_data() {
        // repair against 2 of 3 blobbers still needs 2 successes
        let c = Consensus::with_full(2, 1, 2);
        assert_eq!(c.threshold(), 2);
    }

    #[test]
    fn test_threshold_capped_by_restricted_set() {
        // repairing a single blobber needs exactly that one success
        assert_eq!(Consensus::with_full(2, 1, 1).threshold(), 1);
    }

    #[test]
    fn test_consensus_check() {
        let mut c = Consensus::new(2, 1);
        c.add_success();
        assert!(c.check().is_err());
        c.add_success();
        assert!(c.check().is_ok());
        assert!(c.is_met());
    }

    #[test]
    fn test_consensus_viability() {
        let c = Consensus::new(2, 1);
        let mut mask = BlobberMask::all(3);
        assert!(c.is_viable(&mask));
        mask.clear(0);
        mask.clear(1);
        assert!(!c.is_viable(&mask));
    }
}

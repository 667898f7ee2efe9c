//! Tuning knobs for equality joins.

use std::num::NonZeroUsize;
use std::thread;

/// Smallest and largest supported radix fan-out.
const MIN_RADIX_BITS: u32 = 1;
const MAX_RADIX_BITS: u32 = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct JoinConfig {
    radix_bits: u32,
    threads: usize,
}

impl JoinConfig {
    pub fn new() -> Self {
        Self {
            radix_bits: 7,
            threads: 1,
        }
    }

    /// One worker per available core.
    pub fn parallel() -> Self {
        let threads = thread::available_parallelism().map_or(1, NonZeroUsize::get);
        Self::new().with_threads(threads)
    }

    pub fn with_radix_bits(mut self, radix_bits: u32) -> Self {
        self.radix_bits = radix_bits.clamp(MIN_RADIX_BITS, MAX_RADIX_BITS);
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Number of hash bits used to pick a partition, always in `1..=16`.
    pub fn radix_bits(&self) -> u32 {
        self.radix_bits
    }

    /// Worker threads used to join bucket pairs. `1` joins inline.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// `2^radix_bits` buckets.
    pub fn num_partitions(&self) -> usize {
        1 << self.radix_bits
    }
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = JoinConfig::default();
        assert_eq!(c.radix_bits(), 7);
        assert_eq!(c.num_partitions(), 128);
        assert_eq!(c.threads(), 1);
    }

    #[test]
    fn radix_bits_are_clamped() {
        assert_eq!(JoinConfig::new().with_radix_bits(0).radix_bits(), 1);
        assert_eq!(JoinConfig::new().with_radix_bits(40).radix_bits(), 16);
    }

    #[test]
    fn threads_never_zero() {
        assert_eq!(JoinConfig::new().with_threads(0).threads(), 1);
        assert!(JoinConfig::parallel().threads() >= 1);
    }
}

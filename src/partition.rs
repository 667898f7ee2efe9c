//! Radix partitioning of a tuple set.
//!
//! Tuples are bucketed by the top `radix_bits` of the Fibonacci hash of their
//! payload so that equal payloads always meet in the same partition on both
//! sides of a join.
//!
//! Three passes, all O(n):
//! 1. Histogram of tuples per partition
//! 2. Prefix sum of the histogram into partition offsets
//! 3. Stable scatter of every tuple to its partition's cursor
//!
//! ```text
//!  offsets                          tuples
//! ┌──────────────┐                ┌───────────────────────┐
//! │ p0: 0        │───────────────►│ tuples hashing to p0  │
//! │ p1: 3        │───────────────►├───────────────────────┤
//! │ p2: 3 (empty)│                │ tuples hashing to p1  │
//! │ ...          │                │ ...                   │
//! │ end: n       │                └───────────────────────┘
//! └──────────────┘
//! ```
use crate::config::JoinConfig;
use crate::relation::Tuple;

const FIBONACCI: u64 = 11_400_714_819_323_198_485;

#[inline(always)]
pub(crate) fn hash(value: u64) -> u64 {
    value.wrapping_mul(FIBONACCI)
}

/// Partition a payload falls into under `radix_bits`.
#[inline(always)]
pub fn partition_of(payload: u64, radix_bits: u32) -> usize {
    (hash(payload) >> (64 - radix_bits)) as usize
}

/// A contiguous run of tuples sharing one partition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Bucket<'a> {
    pub partition: usize,
    pub tuples: &'a [Tuple],
}

impl Bucket<'_> {
    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }
}

/// Prefix-sum partition table over one tuple set.
pub struct PsumTable {
    tuples: Vec<Tuple>,
    /// `offsets[p]..offsets[p + 1]` is partition `p`.
    offsets: Vec<usize>,
}

impl PsumTable {
    pub fn new(input: &[Tuple], config: &JoinConfig) -> Self {
        let radix_bits = config.radix_bits();
        debug_assert!((1..=16).contains(&radix_bits));
        let partitions = config.num_partitions();

        // Phase 1: Histogram
        let mut offsets = vec![0_usize; partitions + 1];
        for t in input {
            offsets[partition_of(t.payload, radix_bits) + 1] += 1;
        }

        // Phase 2: Prefix sum
        for p in 1..offsets.len() {
            offsets[p] += offsets[p - 1];
        }
        debug_assert_eq!(offsets[partitions], input.len());

        // Phase 3: Scatter
        let mut tuples = vec![Tuple::default(); input.len()];
        let mut cursors = offsets[..partitions].to_vec();
        for t in input {
            let p = partition_of(t.payload, radix_bits);
            tuples[cursors[p]] = *t;
            cursors[p] += 1;
        }

        Self { tuples, offsets }
    }

    pub fn num_partitions(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Total tuples across all partitions.
    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Partition `p`, possibly empty.
    pub fn bucket(&self, partition: usize) -> Bucket<'_> {
        let start = self.offsets[partition];
        let end = self.offsets[partition + 1];
        Bucket {
            partition,
            tuples: &self.tuples[start..end],
        }
    }

    /// Non-empty buckets in partition order. An empty input yields none.
    pub fn buckets(&self) -> impl Iterator<Item = Bucket<'_>> {
        (0..self.num_partitions())
            .map(|p| self.bucket(p))
            .filter(|b| !b.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn tuples(payloads: &[u64]) -> Vec<Tuple> {
        payloads
            .iter()
            .enumerate()
            .map(|(i, &p)| Tuple::new(i as u64, p))
            .collect()
    }

    #[test]
    fn hash_zero() {
        assert_eq!(hash(0), 0);
        assert_eq!(partition_of(0, 7), 0);
    }

    #[test]
    fn empty_input_yields_no_buckets() {
        let table = PsumTable::new(&[], &JoinConfig::new());
        assert!(table.is_empty());
        assert_eq!(table.num_partitions(), 128);
        assert_eq!(table.buckets().count(), 0);
    }

    #[test]
    fn equal_payloads_share_a_bucket() {
        let input = tuples(&[5, 9, 5, 5, 9, 1]);
        let table = PsumTable::new(&input, &JoinConfig::new().with_radix_bits(4));

        for bucket in table.buckets() {
            for t in bucket.tuples {
                assert_eq!(partition_of(t.payload, 4), bucket.partition);
            }
        }
        let fives = table.bucket(partition_of(5, 4));
        assert_eq!(fives.tuples.iter().filter(|t| t.payload == 5).count(), 3);
    }

    #[test]
    fn scatter_is_stable() {
        let input = tuples(&[3, 3, 3, 3]);
        let table = PsumTable::new(&input, &JoinConfig::new().with_radix_bits(2));
        let bucket = table.buckets().next().unwrap();
        let keys: Vec<u64> = bucket.tuples.iter().map(|t| t.key).collect();
        assert_eq!(keys, vec![0, 1, 2, 3]);
    }

    #[test]
    fn buckets_come_in_partition_order() {
        let input = tuples(&(0..1000).collect::<Vec<_>>());
        let table = PsumTable::new(&input, &JoinConfig::new());
        let partitions: Vec<usize> = table.buckets().map(|b| b.partition).collect();
        assert!(partitions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(table.buckets().map(|b| b.len()).sum::<usize>(), 1000);
    }

    proptest! {
        #[test]
        fn partitioning_loses_and_duplicates_nothing(
            payloads in prop::collection::vec(any::<u64>(), 0..500),
            radix_bits in 1_u32..10,
        ) {
            let input = tuples(&payloads);
            let table = PsumTable::new(&input, &JoinConfig::new().with_radix_bits(radix_bits));

            let mut out: Vec<Tuple> = table.buckets().flat_map(|b| b.tuples.to_vec()).collect();
            let mut expected = input.clone();
            out.sort_by_key(|t| t.key);
            expected.sort_by_key(|t| t.key);
            prop_assert_eq!(out, expected);
        }
    }
}

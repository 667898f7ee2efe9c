//! Hash index over one partition and the radix join driver.
//!
//! The index is an unchained table: a directory of prefix-summed offsets into
//! one contiguous tuple array, each directory entry carrying a 16-bit Bloom
//! tag so probes for absent payloads stop before touching tuple storage.
//!
//! ```text
//!  Directory (Vec<DirectoryEntry>)     Tuples (Vec<Tuple>)
//! ┌────────────────────────┐          ┌──────────────────────────┐
//! │ sentinel: off=0  bl=0  │─────────►│ tuples in slot 0         │
//! ├────────────────────────┤          ├──────────────────────────┤
//! │ slot 0:   off=2  bl=.. │─────────►│ tuples in slot 1         │
//! │ slot 1:   off=5  bl=.. │          │ ...                      │
//! │ ...                    │          └──────────────────────────┘
//! └────────────────────────┘
//!
//! Each directory entry (u64):
//!   bits [63:16] = end offset of the slot's tuple range
//!   bits [15:0]  = Bloom filter
//! ```
//!
//! Partition, slot and Bloom tag are all drawn from one Fibonacci hash of the
//! payload, from disjoint bit ranges: the radix partition uses the top bits,
//! the tag bits `[47:32]` and the slot the bits just below 32.
use std::panic;
use std::thread;

use tracing::trace;

use crate::config::JoinConfig;
use crate::error::Result;
use crate::partition::{Bucket, PsumTable, hash};
use crate::query::Comparison;
use crate::relation::Tuple;
use crate::result::{Pair, ResultList};

#[inline(always)]
fn bloom_tag(h: u64) -> u16 {
    let bits = (h >> 32) as u16;
    (1_u16 << (bits & 15))
        | (1_u16 << ((bits >> 4) & 15))
        | (1_u16 << ((bits >> 8) & 15))
        | (1_u16 << ((bits >> 12) & 15))
}

#[inline(always)]
fn bloom_check_tag(tag: u16, entry: u16) -> bool {
    (entry & tag) == tag
}

#[inline(always)]
fn slot_of(h: u64, shift: u32) -> usize {
    (h.rotate_left(32) >> shift) as usize
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
struct DirectoryEntry(u64);

impl DirectoryEntry {
    const EMPTY: Self = Self(0);
    const OFFSET_SHIFT: u32 = 16;

    #[inline(always)]
    fn new(offset: u64, bloom: u16) -> Self {
        Self((offset << Self::OFFSET_SHIFT) | bloom as u64)
    }

    #[inline(always)]
    fn offset(self) -> u64 {
        self.0 >> Self::OFFSET_SHIFT
    }

    #[inline(always)]
    fn bloom(self) -> u16 {
        self.0 as u16
    }

    #[inline(always)]
    fn with_tag(self, tag: u16) -> Self {
        Self(self.0 | tag as u64)
    }

    #[inline(always)]
    fn add_offset(self, delta: u64) -> Self {
        Self(self.0.wrapping_add(delta << Self::OFFSET_SHIFT))
    }
}

/// Directory size (power-of-two slots) and shift for slot selection.
/// Sized to ~1.125n, minimum 16 slots.
fn compute_table_params(num_tuples: usize) -> (usize, u32) {
    let target = (num_tuples + (num_tuples / 8)).max(16);
    let table_size = target.next_power_of_two();
    let shift = 64 - table_size.trailing_zeros();
    (table_size, shift)
}

/// Which side's key lands in `Pair::key1`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Order {
    BuildFirst,
    ProbeFirst,
}

impl Order {
    #[inline(always)]
    fn pair(self, build: u64, probe: u64) -> Pair {
        match self {
            Order::BuildFirst => Pair::new(build, probe),
            Order::ProbeFirst => Pair::new(probe, build),
        }
    }
}

pub struct Index {
    directory: Vec<DirectoryEntry>,
    tuples: Vec<Tuple>,
    shift: u32,
}

impl Index {
    /// Builds the index over `build`, keyed by payload. Duplicate payloads are
    /// all kept, in input order.
    pub fn new(build: &[Tuple]) -> Self {
        let (table_size, shift) = compute_table_params(build.len());
        let mut directory = vec![DirectoryEntry::EMPTY; table_size + 1];

        // Phase 1: Count per slot + accumulate Bloom tags
        for t in build {
            let h = hash(t.payload);
            let slot = slot_of(h, shift);
            directory[slot + 1] = directory[slot + 1].add_offset(1).with_tag(bloom_tag(h));
        }

        // Phase 2: Exclusive prefix sum
        let mut cumulative: u64 = 0;
        for entry in directory.iter_mut().skip(1) {
            let count = entry.offset();
            *entry = DirectoryEntry::new(cumulative, entry.bloom());
            cumulative += count;
        }
        debug_assert_eq!(cumulative, build.len() as u64);

        // Phase 3: Copy tuples to their slot
        let mut tuples = vec![Tuple::default(); build.len()];
        for t in build {
            let slot = slot_of(hash(t.payload), shift);
            let cursor = directory[slot + 1].offset() as usize;
            tuples[cursor] = *t;
            directory[slot + 1] = directory[slot + 1].add_offset(1);
        }

        Self {
            directory,
            tuples,
            shift,
        }
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Bloom filter check only, false means no build tuple carries `payload`.
    #[inline(always)]
    pub fn bloom_check(&self, payload: u64) -> bool {
        let h = hash(payload);
        let entry = self.directory[slot_of(h, self.shift) + 1];
        bloom_check_tag(bloom_tag(h), entry.bloom())
    }

    /// Build tuples whose payload equals `payload`, in build order.
    #[inline(always)]
    pub fn matches(&self, payload: u64) -> impl Iterator<Item = &Tuple> + '_ {
        let h = hash(payload);
        let slot = slot_of(h, self.shift);
        let entry = self.directory[slot + 1];

        let range = if bloom_check_tag(bloom_tag(h), entry.bloom()) {
            self.directory[slot].offset() as usize..entry.offset() as usize
        } else {
            0..0
        };
        self.tuples[range]
            .iter()
            .filter(move |t| t.payload == payload)
    }

    /// Probes the index with every tuple of `probe` and appends one pair per
    /// match, grouped by probe tuple in scan order.
    pub fn join(&self, probe: &[Tuple], out: &mut ResultList, order: Order) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        for (i, p) in probe.iter().enumerate() {
            #[cfg(feature = "nightly")]
            if let Some(next) = probe.get(i + 1) {
                let slot = slot_of(hash(next.payload), self.shift);
                unsafe {
                    std::intrinsics::prefetch_read_data::<DirectoryEntry, 3>(
                        self.directory.as_ptr().add(slot + 1),
                    );
                }
            }
            #[cfg(not(feature = "nightly"))]
            let _ = i;

            for b in self.matches(p.payload) {
                out.append(order.pair(b.key, p.key))?;
            }
        }
        Ok(())
    }
}

fn join_bucket(build: Bucket<'_>, probe: Bucket<'_>, order: Order, out: &mut ResultList) -> Result<()> {
    if probe.is_empty() {
        return Ok(());
    }
    let before = out.len();
    Index::new(build.tuples).join(probe.tuples, out, order)?;
    trace!(
        partition = build.partition,
        build = build.len(),
        probe = probe.len(),
        emitted = out.len() - before,
        "bucket joined"
    );
    Ok(())
}

/// Equi-join of `left` and `right` on payload.
///
/// Both sides are radix partitioned with the same fan-out, the smaller side
/// is indexed bucket by bucket and probed with the other side's bucket of the
/// same partition. Pairs are always `(left key, right key)`.
pub fn radix_join(left: &[Tuple], right: &[Tuple], config: &JoinConfig) -> Result<ResultList> {
    let mut out = ResultList::new();
    if left.is_empty() || right.is_empty() {
        return Ok(out);
    }

    let left_builds = left.len() <= right.len();
    let (build, probe, order) = if left_builds {
        (left, right, Order::BuildFirst)
    } else {
        (right, left, Order::ProbeFirst)
    };

    let build_table = PsumTable::new(build, config);
    let probe_table = PsumTable::new(probe, config);

    if config.threads() <= 1 {
        for bucket in build_table.buckets() {
            join_bucket(bucket, probe_table.bucket(bucket.partition), order, &mut out)?;
        }
        return Ok(out);
    }

    let buckets: Vec<Bucket<'_>> = build_table.buckets().collect();
    let chunk_size = buckets.len().div_ceil(config.threads()).max(1);
    let partials: Vec<Result<ResultList>> = thread::scope(|s| {
        let handles: Vec<_> = buckets
            .chunks(chunk_size)
            .map(|chunk| {
                let probe_table = &probe_table;
                s.spawn(move || -> Result<ResultList> {
                    let mut local = ResultList::new();
                    for &bucket in chunk {
                        join_bucket(bucket, probe_table.bucket(bucket.partition), order, &mut local)?;
                    }
                    Ok(local)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|e| panic::resume_unwind(e)))
            .collect()
    });

    for partial in partials {
        out.absorb(partial?)?;
    }
    Ok(out)
}

/// Pairwise join for comparisons the hash index cannot answer. Emits
/// `(left key, right key)` for every pair with `cmp(left, right)`.
pub fn nested_loop_join(left: &[Tuple], right: &[Tuple], cmp: Comparison) -> Result<ResultList> {
    let mut out = ResultList::new();
    for l in left {
        for r in right {
            if cmp.holds(l.payload, r.payload) {
                out.append(Pair::new(l.key, r.key))?;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;
    use shuttle::thread;

    use super::*;

    fn identity(n: u64) -> Vec<Tuple> {
        (0..n).map(|i| Tuple::new(i, i)).collect()
    }

    fn sorted(list: &ResultList) -> Vec<Pair> {
        let mut pairs: Vec<Pair> = list.iter().copied().collect();
        pairs.sort();
        pairs
    }

    fn brute_force(left: &[Tuple], right: &[Tuple]) -> Vec<Pair> {
        let mut pairs = Vec::new();
        for l in left {
            for r in right {
                if l.payload == r.payload {
                    pairs.push(Pair::new(l.key, r.key));
                }
            }
        }
        pairs.sort();
        pairs
    }

    // -- Directory tests ----------------------------------------------------

    #[test]
    fn directory_fields() {
        let e = DirectoryEntry::new(123456, 0xABCD);
        assert_eq!(e.offset(), 123456);
        assert_eq!(e.bloom(), 0xABCD);
        let e = e.add_offset(4).with_tag(0b10);
        assert_eq!(e.offset(), 123460);
        assert_eq!(e.bloom(), 0xABCF);
    }

    #[test]
    fn sizing_basics() {
        let (size, shift) = compute_table_params(0);
        assert_eq!(size, 16);
        assert_eq!(shift, 60);

        for n in [100, 10_000, 1_000_000] {
            let (size, shift) = compute_table_params(n);
            assert!(size.is_power_of_two());
            assert!(size >= n);
            assert_eq!(1_usize << (64 - shift), size);
        }
    }

    #[test]
    fn bloom_tags_set_at_most_four_bits() {
        for v in 0..10_000_u64 {
            let ones = bloom_tag(hash(v)).count_ones();
            assert!((1..=4).contains(&ones));
        }
    }

    // -- Index tests --------------------------------------------------------

    #[test]
    fn matches_single() {
        let index = Index::new(&[Tuple::new(3, 42)]);
        let found: Vec<Tuple> = index.matches(42).copied().collect();
        assert_eq!(found, vec![Tuple::new(3, 42)]);
        assert_eq!(index.matches(99).count(), 0);
    }

    #[test]
    fn matches_keep_duplicates_in_build_order() {
        let index = Index::new(&[
            Tuple::new(0, 10),
            Tuple::new(1, 20),
            Tuple::new(2, 10),
            Tuple::new(3, 10),
        ]);
        let keys: Vec<u64> = index.matches(10).map(|t| t.key).collect();
        assert_eq!(keys, vec![0, 2, 3]);
    }

    #[test]
    fn bloom_has_no_false_negatives() {
        let build = identity(10_000);
        let index = Index::new(&build);
        assert_eq!(index.len(), 10_000);
        for t in &build {
            assert!(index.bloom_check(t.payload), "bloom rejected {}", t.payload);
        }
    }

    #[test]
    fn empty_index_joins_nothing() {
        let index = Index::new(&[]);
        let mut out = ResultList::new();
        index.join(&identity(10), &mut out, Order::BuildFirst).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn empty_probe_joins_nothing() {
        let index = Index::new(&identity(10));
        let mut out = ResultList::new();
        index.join(&[], &mut out, Order::BuildFirst).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn join_identity_buckets() {
        let a = identity(10);
        let b = identity(10);
        let mut out = ResultList::new();
        Index::new(&a).join(&b, &mut out, Order::BuildFirst).unwrap();

        let pairs: Vec<Pair> = out.iter().copied().collect();
        assert_eq!(pairs, (0..10).map(|i| Pair::new(i, i)).collect::<Vec<_>>());
    }

    #[test]
    fn join_order_swaps_keys() {
        let build = [Tuple::new(7, 1)];
        let probe = [Tuple::new(2, 1)];

        let mut first = ResultList::new();
        Index::new(&build).join(&probe, &mut first, Order::BuildFirst).unwrap();
        let mut second = ResultList::new();
        Index::new(&build).join(&probe, &mut second, Order::ProbeFirst).unwrap();

        assert_eq!(first.iter().next(), Some(&Pair::new(7, 2)));
        assert_eq!(second.iter().next(), Some(&Pair::new(2, 7)));
    }

    #[test]
    fn join_groups_by_probe_tuple() {
        let build = [Tuple::new(0, 5), Tuple::new(1, 5)];
        let probe = [Tuple::new(8, 5), Tuple::new(9, 5)];
        let mut out = ResultList::new();
        Index::new(&build).join(&probe, &mut out, Order::ProbeFirst).unwrap();
        let pairs: Vec<Pair> = out.iter().copied().collect();
        assert_eq!(
            pairs,
            vec![
                Pair::new(8, 0),
                Pair::new(8, 1),
                Pair::new(9, 0),
                Pair::new(9, 1)
            ]
        );
    }

    // -- Radix join tests ---------------------------------------------------

    #[test]
    fn radix_join_is_left_right_regardless_of_build_side() {
        let small = vec![Tuple::new(0, 5), Tuple::new(1, 9)];
        let large: Vec<Tuple> = (0..50).map(|i| Tuple::new(i, i % 10)).collect();
        let config = JoinConfig::new();

        let small_left = radix_join(&small, &large, &config).unwrap();
        let large_left = radix_join(&large, &small, &config).unwrap();

        assert_eq!(sorted(&small_left), brute_force(&small, &large));
        assert_eq!(sorted(&large_left), brute_force(&large, &small));
    }

    #[test]
    fn radix_join_empty_side() {
        let config = JoinConfig::new();
        assert!(radix_join(&[], &identity(5), &config).unwrap().is_empty());
        assert!(radix_join(&identity(5), &[], &config).unwrap().is_empty());
    }

    #[test]
    fn radix_join_parallel_matches_sequential() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let left: Vec<Tuple> = (0..5_000)
            .map(|i| Tuple::new(i, rng.random_range(0..1_000)))
            .collect();
        let right: Vec<Tuple> = (0..8_000)
            .map(|i| Tuple::new(i, rng.random_range(0..1_000)))
            .collect();

        let sequential = radix_join(&left, &right, &JoinConfig::new()).unwrap();
        let parallel = radix_join(&left, &right, &JoinConfig::new().with_threads(4)).unwrap();
        assert_eq!(sorted(&sequential), sorted(&parallel));
        assert_eq!(sorted(&sequential), brute_force(&left, &right));
    }

    #[test]
    fn radix_join_with_out_of_range_bits() {
        let tuples: Vec<Tuple> = (0..100).map(|i| Tuple::new(i, i % 7)).collect();
        let expected = brute_force(&tuples, &tuples);
        for bits in [0, 17, 40, u32::MAX] {
            let config = JoinConfig::new().with_radix_bits(bits);
            assert!((1..=16).contains(&config.radix_bits()));
            let out = radix_join(&tuples, &tuples, &config).unwrap();
            assert_eq!(sorted(&out), expected, "radix_bits request {bits}");
        }
    }

    #[test]
    fn nested_loop_less_than() {
        let left = vec![Tuple::new(0, 1), Tuple::new(1, 5)];
        let right = vec![Tuple::new(0, 3), Tuple::new(1, 6)];
        let out = nested_loop_join(&left, &right, Comparison::Less).unwrap();
        assert_eq!(
            sorted(&out),
            vec![Pair::new(0, 0), Pair::new(0, 1), Pair::new(1, 1)]
        );
    }

    #[test]
    fn shuttle_concurrent_readers() {
        shuttle::check_random(
            || {
                let left: Arc<Vec<Tuple>> = Arc::new((0..64).map(|i| Tuple::new(i, i % 8)).collect());
                let right: Arc<Vec<Tuple>> = Arc::new((0..32).map(|i| Tuple::new(i, i % 4)).collect());
                let expected = brute_force(&left, &right);

                let handles: Vec<_> = (0..4)
                    .map(|i| {
                        let left = left.clone();
                        let right = right.clone();
                        thread::spawn(move || {
                            let config = JoinConfig::new().with_radix_bits(1 + i);
                            sorted(&radix_join(&left, &right, &config).unwrap())
                        })
                    })
                    .collect();

                for h in handles {
                    assert_eq!(h.join().unwrap(), expected);
                }
            },
            50,
        );
    }

    proptest! {
        #[test]
        fn radix_join_is_complete_and_sound(
            left in prop::collection::vec(0_u64..64, 0..200),
            right in prop::collection::vec(0_u64..64, 0..200),
            radix_bits in 1_u32..8,
        ) {
            let left: Vec<Tuple> = left.iter().enumerate().map(|(i, &p)| Tuple::new(i as u64, p)).collect();
            let right: Vec<Tuple> = right.iter().enumerate().map(|(i, &p)| Tuple::new(i as u64, p)).collect();
            let config = JoinConfig::new().with_radix_bits(radix_bits);

            let out = radix_join(&left, &right, &config).unwrap();
            prop_assert_eq!(sorted(&out), brute_force(&left, &right));
        }
    }
}

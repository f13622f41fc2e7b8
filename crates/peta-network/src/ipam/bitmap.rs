//! Fixed-capacity allocation bitmap.
//!
//! Each allocatable slot has an offset in `[0, max)` and one bit in the
//! map. `count` always equals the number of set bits; it is maintained
//! incrementally and recomputed from scratch on restore.

use parking_lot::Mutex;
use rand::Rng;

use super::IpamError;

/// Allocation of items out of a bounded range.
///
/// Implementations must be safe to share between threads.
pub trait Allocator: Send + Sync {
    /// Reserve `offset`. Returns `false` if it is already taken or out of range.
    fn allocate(&self, offset: usize) -> bool;

    /// Reserve any free item, or `None` when the range is exhausted.
    fn allocate_next(&self) -> Option<usize>;

    /// Return `offset` to the pool. Releasing a free or out-of-range item is a no-op.
    fn release(&self, offset: usize);

    /// Call `f` for every allocated offset in ascending order.
    fn for_each(&self, f: &mut dyn FnMut(usize));

    /// Whether `offset` is allocated.
    fn has(&self, offset: usize) -> bool;

    /// Number of items still available.
    fn free(&self) -> usize;
}

/// An [`Allocator`] whose state can be saved and restored.
pub trait Snapshottable: Allocator {
    /// Capture the range tag and raw allocation bytes.
    fn snapshot(&self) -> (String, Vec<u8>);

    /// Replace the allocation state with a previous snapshot of the same range.
    ///
    /// # Errors
    ///
    /// Returns [`IpamError::RangeMismatch`] if `range_spec` names a different
    /// range. The current state is left untouched in that case.
    fn restore(&self, range_spec: &str, data: &[u8]) -> Result<(), IpamError>;
}

/// Search strategy for the next free bit.
pub trait BitStrategy: Send + Sync {
    /// Pick a free offset in `[0, max)` or `None` if there is none.
    fn allocate_bit(&self, bits: &Bits, max: usize, count: usize) -> Option<usize>;
}

/// Start at a random offset and scan forward, wrapping at `max`.
///
/// Spreading allocations avoids handing the most recently released address
/// straight back out after a restart.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomScan;

impl BitStrategy for RandomScan {
    fn allocate_bit(&self, bits: &Bits, max: usize, count: usize) -> Option<usize> {
        if max == 0 || count >= max {
            return None;
        }
        let start = rand::rng().random_range(0..max);
        (0..max)
            .map(|i| (start + i) % max)
            .find(|&at| !bits.get(at))
    }
}

/// A growable little-endian bit vector backed by 64-bit words.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Bits {
    words: Vec<u64>,
}

impl Bits {
    fn with_capacity(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(64)],
        }
    }

    /// Value of bit `at`; bits past the end read as zero.
    #[must_use]
    pub fn get(&self, at: usize) -> bool {
        self.words
            .get(at / 64)
            .is_some_and(|w| w & (1 << (at % 64)) != 0)
    }

    fn set(&mut self, at: usize) {
        self.words[at / 64] |= 1 << (at % 64);
    }

    fn clear(&mut self, at: usize) {
        self.words[at / 64] &= !(1 << (at % 64));
    }

    fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(idx, &word)| {
            let mut word = word;
            std::iter::from_fn(move || {
                if word == 0 {
                    return None;
                }
                let bit = word.trailing_zeros() as usize;
                word &= word - 1;
                Some(idx * 64 + bit)
            })
        })
    }

    /// Encode as the big-endian bytes of the integer whose bit `i` is offset `i`,
    /// without leading zero bytes.
    fn to_be_bytes(&self) -> Vec<u8> {
        let mut le: Vec<u8> = self.words.iter().flat_map(|w| w.to_le_bytes()).collect();
        while le.last() == Some(&0) {
            le.pop();
        }
        le.reverse();
        le
    }

    /// Decode [`Bits::to_be_bytes`] output, keeping only bits below `max`.
    fn from_be_bytes(data: &[u8], max: usize) -> (Self, usize) {
        let mut bits = Self::with_capacity(max);
        let mut dropped = 0;
        for (byte_idx, byte) in data.iter().rev().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) == 0 {
                    continue;
                }
                let at = byte_idx * 8 + bit;
                if at < max {
                    bits.set(at);
                } else {
                    dropped += 1;
                }
            }
        }
        (bits, dropped)
    }
}

#[derive(Debug)]
struct State {
    count: usize,
    bits: Bits,
}

/// A contiguous block of items that can be allocated atomically.
///
/// All operations take the same per-map lock; independent maps never
/// contend with each other.
pub struct AllocationBitmap {
    strategy: Box<dyn BitStrategy>,
    max: usize,
    range_spec: String,
    state: Mutex<State>,
}

impl std::fmt::Debug for AllocationBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AllocationBitmap")
            .field("max", &self.max)
            .field("range_spec", &self.range_spec)
            .field("count", &state.count)
            .finish_non_exhaustive()
    }
}

impl AllocationBitmap {
    /// Create an empty map of `max` items using the random scan strategy.
    pub fn new(max: usize, range_spec: impl Into<String>) -> Self {
        Self::with_strategy(max, range_spec, RandomScan)
    }

    /// Create an empty map with a custom search strategy.
    pub fn with_strategy(
        max: usize,
        range_spec: impl Into<String>,
        strategy: impl BitStrategy + 'static,
    ) -> Self {
        Self {
            strategy: Box::new(strategy),
            max,
            range_spec: range_spec.into(),
            state: Mutex::new(State {
                count: 0,
                bits: Bits::with_capacity(max),
            }),
        }
    }

    /// Capacity of the map.
    #[must_use]
    pub const fn max(&self) -> usize {
        self.max
    }

    /// Tag of the range this map represents.
    #[must_use]
    pub fn range_spec(&self) -> &str {
        &self.range_spec
    }

    /// Number of allocated items.
    #[must_use]
    pub fn count(&self) -> usize {
        self.state.lock().count
    }
}

impl Allocator for AllocationBitmap {
    fn allocate(&self, offset: usize) -> bool {
        if offset >= self.max {
            return false;
        }
        let mut state = self.state.lock();
        if state.bits.get(offset) {
            return false;
        }
        state.bits.set(offset);
        state.count += 1;
        true
    }

    fn allocate_next(&self) -> Option<usize> {
        let mut state = self.state.lock();
        let next = self
            .strategy
            .allocate_bit(&state.bits, self.max, state.count)?;
        state.bits.set(next);
        state.count += 1;
        Some(next)
    }

    fn release(&self, offset: usize) {
        if offset >= self.max {
            return;
        }
        let mut state = self.state.lock();
        if !state.bits.get(offset) {
            return;
        }
        state.bits.clear(offset);
        state.count -= 1;
    }

    fn for_each(&self, f: &mut dyn FnMut(usize)) {
        // Collected under the lock so `f` may call back into the map.
        let offsets: Vec<usize> = self.state.lock().bits.ones().collect();
        for offset in offsets {
            f(offset);
        }
    }

    fn has(&self, offset: usize) -> bool {
        self.state.lock().bits.get(offset)
    }

    fn free(&self) -> usize {
        self.max - self.state.lock().count
    }
}

impl Snapshottable for AllocationBitmap {
    fn snapshot(&self) -> (String, Vec<u8>) {
        let state = self.state.lock();
        (self.range_spec.clone(), state.bits.to_be_bytes())
    }

    fn restore(&self, range_spec: &str, data: &[u8]) -> Result<(), IpamError> {
        if self.range_spec != range_spec {
            return Err(IpamError::RangeMismatch {
                expected: self.range_spec.clone(),
                actual: range_spec.to_string(),
            });
        }

        let (bits, dropped) = Bits::from_be_bytes(data, self.max);
        if dropped > 0 {
            tracing::warn!(
                range = %self.range_spec,
                dropped,
                "Ignoring snapshot bits beyond range capacity"
            );
        }

        let mut state = self.state.lock();
        state.count = bits.count_ones();
        state.bits = bits;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn allocate_next_until_full() {
        let map = AllocationBitmap::new(100, "test");
        for _ in 0..100 {
            assert!(map.allocate_next().is_some());
        }
        assert_eq!(map.allocate_next(), None);
        assert_eq!(map.count(), 100);
        assert_eq!(map.free(), 0);
        let mut seen = 0;
        map.for_each(&mut |_| seen += 1);
        assert_eq!(seen, 100);
    }

    #[test]
    fn allocate_release_allocate() {
        let map = AllocationBitmap::new(16, "test");
        assert!(map.allocate(3));
        map.release(3);
        assert!(map.allocate(3));
        assert!(!map.allocate(3));
        assert_eq!(map.free(), 15);
    }

    #[test]
    fn release_is_noop_for_free_or_out_of_range() {
        let map = AllocationBitmap::new(8, "test");
        map.release(2);
        map.release(1000);
        assert_eq!(map.free(), 8);
        assert!(!map.allocate(8));
        assert!(!map.has(8));
    }

    #[test]
    fn zero_capacity_is_always_full() {
        let map = AllocationBitmap::new(0, "empty");
        assert_eq!(map.allocate_next(), None);
        assert_eq!(map.free(), 0);
    }

    #[test]
    fn for_each_is_ascending() {
        let map = AllocationBitmap::new(200, "test");
        for offset in [150, 3, 64, 0, 127] {
            assert!(map.allocate(offset));
        }
        let mut seen = Vec::new();
        map.for_each(&mut |o| seen.push(o));
        assert_eq!(seen, vec![0, 3, 64, 127, 150]);
    }

    #[test]
    fn snapshot_layout_is_big_endian_minimal() {
        let map = AllocationBitmap::new(16, "test");
        map.allocate(0);
        map.allocate(9);
        let (tag, data) = map.snapshot();
        assert_eq!(tag, "test");
        assert_eq!(data, vec![0x02, 0x01]);

        let empty = AllocationBitmap::new(16, "test");
        assert!(empty.snapshot().1.is_empty());
    }

    #[test]
    fn restore_with_wrong_tag_leaves_state() {
        let map = AllocationBitmap::new(16, "a");
        map.allocate(5);
        let err = map.restore("b", &[0xff]).unwrap_err();
        assert!(matches!(err, IpamError::RangeMismatch { .. }));
        assert!(map.has(5));
        assert_eq!(map.count(), 1);
    }

    #[test]
    fn restore_drops_bits_past_capacity() {
        let map = AllocationBitmap::new(4, "a");
        map.restore("a", &[0xff]).unwrap();
        assert_eq!(map.count(), 4);
        assert_eq!(map.free(), 0);
    }

    proptest! {
        #[test]
        fn snapshot_restore_reproduces_membership(
            max in 1usize..600,
            offsets in proptest::collection::vec(0usize..600, 0..64),
        ) {
            let map = AllocationBitmap::new(max, "range");
            for o in &offsets {
                map.allocate(*o);
            }
            let (tag, data) = map.snapshot();

            let fresh = AllocationBitmap::new(max, "range");
            fresh.restore(&tag, &data).unwrap();
            for o in 0..max {
                prop_assert_eq!(map.has(o), fresh.has(o));
            }
            prop_assert_eq!(map.free(), fresh.free());
        }

        #[test]
        fn count_matches_popcount(ops in proptest::collection::vec((any::<bool>(), 0usize..64), 0..200)) {
            let map = AllocationBitmap::new(64, "range");
            for (alloc, offset) in ops {
                if alloc {
                    map.allocate(offset);
                } else {
                    map.release(offset);
                }
            }
            let mut ones = 0;
            map.for_each(&mut |_| ones += 1);
            prop_assert_eq!(map.count(), ones);
        }
    }
}

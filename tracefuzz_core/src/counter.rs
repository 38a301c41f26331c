//! Fixed-size counter tables keyed by hashed integers.
//!
//! Collisions between distinct keys are ignored: two keys that hash to the
//! same slot share a count. Callers use these tables for bounded-memory,
//! allocation-free bookkeeping, so the counts are approximate by construction.

/// Knuth's multiplicative hashing constant (TAOCP vol. 3, 6.4).
const KNUTH_MULTIPLIER: i64 = 2_654_435_761;

fn cap(x: i64, bound: usize) -> usize {
    x.rem_euclid(bound as i64) as usize
}

/// Bounded multiplicative hash of a single key into `[0, bound)`.
pub fn hash(x: i64, bound: usize) -> usize {
    cap(x.wrapping_mul(KNUTH_MULTIPLIER), bound)
}

/// Bounded hash of a pair of keys into `[0, bound)`.
pub fn hash1(x: i64, y: i64, bound: usize) -> usize {
    hash(x.wrapping_mul(31).wrapping_add(y), bound)
}

/// Maps integer keys to integer counts using a fixed-size table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    counts: Vec<i32>,
}

impl Counter {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "counter size must be positive");
        Self {
            counts: vec![0; size],
        }
    }

    pub fn size(&self) -> usize {
        self.counts.len()
    }

    fn idx(&self, key: i64) -> usize {
        hash(key, self.counts.len())
    }

    /// Increments the count for `key` and returns the new value.
    pub fn increment(&mut self, key: i64) -> i32 {
        self.increment_by(key, 1)
    }

    pub fn increment_by(&mut self, key: i64, delta: i32) -> i32 {
        let idx = self.idx(key);
        self.counts[idx] = self.counts[idx].wrapping_add(delta);
        self.counts[idx]
    }

    pub fn get(&self, key: i64) -> i32 {
        self.counts[self.idx(key)]
    }

    pub fn get_at_index(&self, index: usize) -> i32 {
        self.counts[index]
    }

    pub fn counts(&self) -> &[i32] {
        &self.counts
    }

    pub(crate) fn counts_mut(&mut self) -> &mut [i32] {
        &mut self.counts
    }

    pub fn clear(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
    }

    pub fn non_zero_values(&self) -> Vec<i32> {
        self.counts.iter().copied().filter(|&c| c != 0).collect()
    }

    pub fn non_zero_indices(&self) -> Vec<usize> {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, c)| **c != 0)
            .map(|(i, _)| i)
            .collect()
    }
}

/// A [`Counter`] that remembers which slots are non-zero, so that clearing
/// costs time proportional to the number of touched slots rather than the
/// table size.
#[derive(Debug, Clone)]
pub struct NonZeroCachingCounter {
    inner: Counter,
    non_zero: Vec<usize>,
}

impl NonZeroCachingCounter {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Counter::new(size),
            non_zero: Vec::new(),
        }
    }

    pub fn increment(&mut self, key: i64) -> i32 {
        let idx = self.inner.idx(key);
        let counts = self.inner.counts_mut();
        if counts[idx] == 0 {
            self.non_zero.push(idx);
        }
        counts[idx] = counts[idx].wrapping_add(1);
        counts[idx]
    }

    pub fn get(&self, key: i64) -> i32 {
        self.inner.get(key)
    }

    pub fn non_zero_count(&self) -> usize {
        self.non_zero.len()
    }

    pub fn clear(&mut self) {
        let counts = self.inner.counts_mut();
        for &idx in &self.non_zero {
            counts[idx] = 0;
        }
        self.non_zero.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_bounded_for_negative_and_large_keys() {
        for key in [-1_i64, 0, 1, i32::MAX as i64, i32::MIN as i64, i64::MAX] {
            assert!(hash(key, 6151) < 6151, "key {key} escaped the bound");
        }
        assert!(hash1(-5, 3, 100) < 100);
    }

    #[test]
    fn counter_increments_and_clears() {
        let mut counter = Counter::new(6151);
        assert_eq!(counter.increment(42), 1);
        assert_eq!(counter.increment(42), 2);
        assert_eq!(counter.increment_by(7, 5), 5);
        assert_eq!(counter.get(42), 2);
        assert_eq!(counter.non_zero_values().len(), 2);

        counter.clear();
        assert_eq!(counter.get(42), 0);
        assert!(counter.non_zero_indices().is_empty());
    }

    #[test]
    fn colliding_keys_share_a_slot() {
        let mut counter = Counter::new(1);
        counter.increment(1);
        assert_eq!(counter.increment(999), 2);
    }

    #[test]
    fn caching_counter_clears_only_touched_slots() {
        let mut counter = NonZeroCachingCounter::new(6151);
        counter.increment(10);
        counter.increment(10);
        counter.increment(11);
        assert_eq!(counter.non_zero_count(), 2);
        assert_eq!(counter.get(10), 2);

        counter.clear();
        assert_eq!(counter.non_zero_count(), 0);
        assert_eq!(counter.get(10), 0);
        assert_eq!(counter.increment(10), 1);
    }
}

use crate::counter::{self, Counter};
use crate::event::{BranchArm, TraceEvent, TraceEventKind};

/// Size of the hashed coverage counter. One less than a power of two to
/// reduce collisions.
pub const COVERAGE_MAP_SIZE: usize = (1 << 16) - 1;

/// Default capacity of the byte-oriented trace map shared with an AFL-style
/// coprocess.
pub const DEFAULT_TRACE_MAP_SIZE: usize = 1 << 16;

/// Branch and call coverage for one or more runs, keyed by hashed location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coverage {
    counter: Counter,
}

impl Coverage {
    pub fn new() -> Self {
        Self {
            counter: Counter::new(COVERAGE_MAP_SIZE),
        }
    }

    /// Updates the counters for branch and call events; other events are
    /// ignored.
    pub fn handle_event(&mut self, event: &TraceEvent) {
        match &event.kind {
            TraceEventKind::Branch { arm } => {
                self.counter
                    .increment((event.iid as i64) * 31 + arm.arm_number());
            }
            TraceEventKind::Call { .. } => {
                self.counter.increment(event.iid as i64);
            }
            _ => {}
        }
    }

    /// Number of locations with a non-zero count.
    pub fn non_zero_count(&self) -> usize {
        self.counter.counts().iter().filter(|&&c| c != 0).count()
    }

    /// Covered slots in ascending order.
    pub fn covered_indices(&self) -> Vec<usize> {
        self.counter.non_zero_indices()
    }

    pub fn clear(&mut self) {
        self.counter.clear();
    }

    /// ORs the counts of `that` into `self`. Returns `true` if anything changed.
    pub fn update_bits(&mut self, that: &Coverage) -> bool {
        let mut changed = false;
        for (mine, theirs) in self
            .counter
            .counts_mut()
            .iter_mut()
            .zip(that.counter.counts())
        {
            let before = *mine;
            *mine |= *theirs;
            changed |= *mine != before;
        }
        changed
    }

    /// Raises every count of `self` to at least the count in `that`. Returns
    /// `true` if anything changed.
    pub fn update_max(&mut self, that: &Coverage) -> bool {
        let mut changed = false;
        for (mine, theirs) in self
            .counter
            .counts_mut()
            .iter_mut()
            .zip(that.counter.counts())
        {
            if *theirs > *mine {
                *mine = *theirs;
                changed = true;
            }
        }
        changed
    }
}

impl Default for Coverage {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-size byte map of edge hit counts in the layout expected by an
/// AFL-style coprocess. Counters wrap on overflow, as in AFL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceBits {
    bits: Vec<u8>,
}

impl TraceBits {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "trace map capacity must be positive");
        Self {
            bits: vec![0; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.bits.len()
    }

    /// Bucket for a branch edge. Not-taken edges land on `iid mod CAP` and
    /// taken edges on `CAP - (iid mod CAP)` (wrapped back into range), so the
    /// two directions of one branch use different buckets. Multi-way
    /// dispatch hashes the call site together with the arm.
    pub fn edge_index(&self, iid: i32, arm: BranchArm) -> usize {
        let cap = self.bits.len();
        let edge = (iid as i64).rem_euclid(cap as i64) as usize;
        match arm {
            BranchArm::Taken(false) => edge,
            BranchArm::Taken(true) => (cap - edge) % cap,
            BranchArm::Arm(_) => counter::hash1(iid as i64, arm.arm_number(), cap),
        }
    }

    pub fn increment(&mut self, index: usize) {
        self.bits[index] = self.bits[index].wrapping_add(1);
    }

    /// Records a trace event. Only branches contribute to the map.
    pub fn handle_event(&mut self, event: &TraceEvent) {
        if let TraceEventKind::Branch { arm } = event.kind {
            let index = self.edge_index(event.iid, arm);
            self.increment(index);
        }
    }

    pub fn get(&self, index: usize) -> u8 {
        self.bits[index]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
    }

    /// Zeroes every slot except slot zero.
    pub fn clear_except_first(&mut self) {
        self.bits.iter_mut().skip(1).for_each(|b| *b = 0);
    }

    /// Sets slot zero to one if it is zero, so that the map is never empty.
    pub fn mark_instrumented(&mut self) {
        if self.bits[0] == 0 {
            self.bits[0] = 1;
        }
    }

    /// Indices of non-zero slots in ascending order.
    pub fn covered_indices(&self) -> Vec<usize> {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, b)| **b != 0)
            .map(|(i, _)| i)
            .collect()
    }
}

impl Default for TraceBits {
    fn default() -> Self {
        Self::new(DEFAULT_TRACE_MAP_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SourceSite;

    fn branch(iid: i32, arm: BranchArm) -> TraceEvent {
        TraceEvent::branch(iid, SourceSite::new("T#m", 1), arm)
    }

    #[test]
    fn coverage_counts_branches_and_calls_only() {
        let mut coverage = Coverage::new();
        coverage.handle_event(&branch(5, BranchArm::Taken(true)));
        coverage.handle_event(&branch(5, BranchArm::Taken(false)));
        coverage.handle_event(&TraceEvent::call(9, SourceSite::default(), "T#f"));
        coverage.handle_event(&TraceEvent::read(11, SourceSite::default()));
        assert_eq!(coverage.non_zero_count(), 3);
        assert_eq!(coverage.covered_indices().len(), 3);

        coverage.clear();
        assert_eq!(coverage.non_zero_count(), 0);
    }

    #[test]
    fn update_bits_reports_novelty() {
        let mut total = Coverage::new();
        let mut run = Coverage::new();
        run.handle_event(&branch(1, BranchArm::Taken(true)));
        assert!(total.update_bits(&run));
        assert!(!total.update_bits(&run));

        run.handle_event(&branch(2, BranchArm::Taken(true)));
        assert!(total.update_bits(&run));
        assert_eq!(total.non_zero_count(), 2);
    }

    #[test]
    fn update_max_keeps_highest_counts() {
        let mut total = Coverage::new();
        let mut run = Coverage::new();
        run.handle_event(&branch(1, BranchArm::Taken(true)));
        run.handle_event(&branch(1, BranchArm::Taken(true)));
        assert!(total.update_max(&run));
        assert!(!total.update_max(&run));
    }

    #[test]
    fn branch_polarity_uses_different_buckets() {
        let mut taken = TraceBits::default();
        taken.handle_event(&branch(5, BranchArm::Taken(true)));
        let mut not_taken = TraceBits::default();
        not_taken.handle_event(&branch(5, BranchArm::Taken(false)));

        assert_eq!(not_taken.covered_indices(), vec![5]);
        assert_eq!(taken.covered_indices(), vec![DEFAULT_TRACE_MAP_SIZE - 5]);
    }

    #[test]
    fn edge_zero_taken_stays_in_range() {
        let bits = TraceBits::new(16);
        assert_eq!(bits.edge_index(0, BranchArm::Taken(true)), 0);
        assert_eq!(bits.edge_index(-3, BranchArm::Taken(false)), 13);
        assert!(bits.edge_index(7, BranchArm::Arm(2)) < 16);
    }

    #[test]
    fn counters_wrap_and_slot_zero_is_marked() {
        let mut bits = TraceBits::new(8);
        for _ in 0..256 {
            bits.increment(3);
        }
        assert_eq!(bits.get(3), 0);

        bits.mark_instrumented();
        assert_eq!(bits.get(0), 1);
        bits.increment(4);
        bits.clear_except_first();
        assert_eq!(bits.covered_indices(), vec![0]);
    }
}

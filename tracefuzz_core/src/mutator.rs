use crate::input::IndexedInput;
use rand::Rng;

/// Mean number of mutations applied to each child input.
pub const DEFAULT_MEAN_MUTATION_COUNT: f64 = 1.2;
/// Mean number of contiguous entries touched by one mutation.
pub const DEFAULT_MEAN_MUTATION_SIZE: f64 = 1.5;

/// A `Mutator` derives a new input from a saved parent.
pub trait Mutator<R: Rng + ?Sized> {
    fn mutate(&mut self, parent: &IndexedInput, rng: &mut R) -> IndexedInput;
}

/// Samples a geometrically distributed count with the given mean (at least
/// one for any mean above one, except for a zero uniform draw).
pub fn sample_geometric<R: Rng + ?Sized>(mean: f64, rng: &mut R) -> usize {
    let p = 1.0 / mean;
    let uniform: f64 = rng.random();
    let sample = ((1.0 - uniform).ln() / (1.0 - p).ln()).ceil();
    if sample.is_finite() && sample > 0.0 {
        sample as usize
    } else {
        0
    }
}

/// Replaces a geometric number of contiguous runs of entries, in execution
/// index order, with fresh random bytes.
#[derive(Debug, Clone, Copy)]
pub struct GeometricMutator {
    pub mean_mutation_count: f64,
    pub mean_mutation_size: f64,
}

impl Default for GeometricMutator {
    fn default() -> Self {
        Self {
            mean_mutation_count: DEFAULT_MEAN_MUTATION_COUNT,
            mean_mutation_size: DEFAULT_MEAN_MUTATION_SIZE,
        }
    }
}

impl GeometricMutator {
    fn mutate_run<R: Rng + ?Sized>(&self, input: &mut IndexedInput, rng: &mut R) {
        if input.is_empty() {
            return;
        }
        let start = rng.random_range(0..input.len());
        let size = sample_geometric(self.mean_mutation_size, rng);
        for value in input.values_mut().skip(start).take(size) {
            *value = rng.random();
        }
    }
}

impl<R: Rng + ?Sized> Mutator<R> for GeometricMutator {
    fn mutate(&mut self, parent: &IndexedInput, rng: &mut R) -> IndexedInput {
        let mut child = parent.child();
        let mutations = sample_geometric(self.mean_mutation_count, rng);
        for _ in 0..mutations {
            self.mutate_run(&mut child, rng);
        }
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution_index::ExecutionIndex;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn parent_with(n: i32, rng: &mut ChaCha8Rng) -> IndexedInput {
        let mut parent = IndexedInput::new();
        for site in 0..n {
            let key = ExecutionIndex::new(vec![site, 1]).unwrap();
            parent.get_or_generate_fresh(key, rng);
        }
        parent.gc();
        parent
    }

    #[test]
    fn geometric_samples_track_the_mean() {
        let mut rng = ChaCha8Rng::from_seed([9; 32]);
        let draws = 20_000;
        let total: usize = (0..draws).map(|_| sample_geometric(1.5, &mut rng)).sum();
        let mean = total as f64 / draws as f64;
        assert!(
            (1.35..1.65).contains(&mean),
            "sample mean {mean} too far from 1.5"
        );
    }

    #[test]
    fn children_keep_keys_and_change_few_values() {
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        let parent = parent_with(64, &mut rng);
        let mut mutator = GeometricMutator::default();

        let mut changed_children = 0;
        for _ in 0..100 {
            let mut child = mutator.mutate(&parent, &mut rng);
            assert_eq!(child.len(), parent.len(), "mutation must not add or drop keys");
            assert!(!child.is_favoured());
            let differing = child
                .values_mut()
                .zip(parent.clone().values_mut())
                .filter(|(a, b)| **a != **b)
                .count();
            assert!(differing <= 64);
            if differing > 0 {
                changed_children += 1;
            }
        }
        assert!(changed_children > 50, "only {changed_children} of 100 children changed");
    }

    #[test]
    fn mutating_an_empty_parent_yields_an_empty_child() {
        let mut rng = ChaCha8Rng::from_seed([2; 32]);
        let child = GeometricMutator::default().mutate(&IndexedInput::new(), &mut rng);
        assert!(child.is_empty());
    }
}

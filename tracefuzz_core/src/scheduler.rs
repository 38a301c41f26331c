use crate::corpus::Corpus;
use log::debug;
use rand::Rng;
use thiserror::Error;

/// Number of children generated from a parent before moving on.
pub const DEFAULT_CHILDREN_PER_PARENT: usize = 600;
/// Probability of picking a favoured parent when cycling past it.
pub const FAVOURED_SELECTION_PROBABILITY: f64 = 0.8;
/// Probability of picking any other parent when cycling past it.
pub const UNFAVOURED_SELECTION_PROBABILITY: f64 = 0.2;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The corpus is empty, so no parent can be scheduled.
    #[error("Corpus is empty, cannot schedule next input")]
    CorpusEmpty,
}

/// Walks the saved inputs in order, generating a fixed number of children
/// from each parent. When moving on, each candidate is accepted with a
/// probability that depends on whether it is favoured; rejected candidates
/// are skipped until one is accepted.
#[derive(Debug, Clone)]
pub struct CyclingScheduler {
    children_per_parent: usize,
    current_parent: usize,
    children_generated: usize,
    cycles_completed: u64,
}

impl Default for CyclingScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_CHILDREN_PER_PARENT)
    }
}

impl CyclingScheduler {
    pub fn new(children_per_parent: usize) -> Self {
        Self {
            children_per_parent,
            current_parent: 0,
            children_generated: 0,
            cycles_completed: 0,
        }
    }

    pub fn current_parent(&self) -> usize {
        self.current_parent
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    /// Returns the ID of the parent for the next child and counts the child
    /// against that parent.
    pub fn next<R: Rng + ?Sized>(
        &mut self,
        corpus: &dyn Corpus,
        rng: &mut R,
    ) -> Result<usize, SchedulerError> {
        if corpus.is_empty() {
            return Err(SchedulerError::CorpusEmpty);
        }
        if self.children_generated >= self.children_per_parent {
            loop {
                self.current_parent = (self.current_parent + 1) % corpus.len();
                if self.current_parent == 0 {
                    self.cycles_completed += 1;
                    debug!("Cycle {} completed.", self.cycles_completed);
                }
                let favoured = corpus
                    .get(self.current_parent)
                    .is_some_and(|input| input.is_favoured());
                let probability = if favoured {
                    FAVOURED_SELECTION_PROBABILITY
                } else {
                    UNFAVOURED_SELECTION_PROBABILITY
                };
                if rng.random_bool(probability) {
                    break;
                }
            }
            self.children_generated = 0;
        }
        self.children_generated += 1;
        Ok(self.current_parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::InMemoryCorpus;
    use crate::input::IndexedInput;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn corpus_with(favoured: &[bool]) -> InMemoryCorpus {
        let mut corpus = InMemoryCorpus::new();
        for (trial, &fav) in favoured.iter().enumerate() {
            let mut input = IndexedInput::new();
            input.set_favoured(fav);
            corpus.add(input, trial as u64).expect("in-memory add cannot fail");
        }
        corpus
    }

    #[test]
    fn empty_corpus_cannot_be_scheduled() {
        let mut scheduler = CyclingScheduler::default();
        let corpus = InMemoryCorpus::new();
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        assert!(matches!(
            scheduler.next(&corpus, &mut rng),
            Err(SchedulerError::CorpusEmpty)
        ));
    }

    #[test]
    fn parent_is_kept_for_its_children_budget() {
        let mut scheduler = CyclingScheduler::new(3);
        let corpus = corpus_with(&[true, true]);
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        let first: Vec<usize> = (0..3)
            .map(|_| scheduler.next(&corpus, &mut rng).unwrap())
            .collect();
        assert_eq!(first, vec![0, 0, 0]);
        let fourth = scheduler.next(&corpus, &mut rng).unwrap();
        assert!(fourth < corpus.len());
    }

    #[test]
    fn favoured_parents_are_picked_more_often() {
        let mut scheduler = CyclingScheduler::new(1);
        let corpus = corpus_with(&[true, false, true, false]);
        let mut rng = ChaCha8Rng::from_seed([2; 32]);
        let mut picks = [0usize; 4];
        for _ in 0..4_000 {
            picks[scheduler.next(&corpus, &mut rng).unwrap()] += 1;
        }
        let favoured = picks[0] + picks[2];
        let unfavoured = picks[1] + picks[3];
        assert!(
            favoured > 2 * unfavoured,
            "favoured {favoured} vs unfavoured {unfavoured}"
        );
        assert!(scheduler.cycles_completed() > 0);
    }
}

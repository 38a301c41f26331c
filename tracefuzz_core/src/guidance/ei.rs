use super::{DiscardTracker, Guidance, GuidanceError, TrialResult, lock};
use crate::corpus::{Corpus, CorpusError};
use crate::coverage::Coverage;
use crate::event::{EventCallback, TraceThread};
use crate::indexing::{
    DEFAULT_COUNTER_SIZE, DEFAULT_MAX_DEPTH, ExecutionIndexingState, IndexingError, IndexingMode,
};
use crate::input::IndexedInput;
use crate::mutator::{
    DEFAULT_MEAN_MUTATION_COUNT, DEFAULT_MEAN_MUTATION_SIZE, GeometricMutator, Mutator,
};
use crate::outcome::TrialError;
use crate::scheduler::{CyclingScheduler, DEFAULT_CHILDREN_PER_PARENT};
use log::{debug, error, info, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read};
use std::mem;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Trials allowed to run before at least one input must have been saved.
pub const DEFAULT_MAX_FRUITLESS_TRIALS: u64 = 100;

/// Tuning knobs for [`ExecutionIndexingGuidance`].
#[derive(Debug, Clone)]
pub struct ExecutionIndexingSettings {
    pub max_trials: u64,
    pub mode: IndexingMode,
    pub counter_size: usize,
    pub max_depth: usize,
    pub children_per_parent: usize,
    pub mean_mutation_count: f64,
    pub mean_mutation_size: f64,
    pub max_fruitless_trials: u64,
}

impl Default for ExecutionIndexingSettings {
    fn default() -> Self {
        Self {
            max_trials: u64::MAX,
            mode: IndexingMode::default(),
            counter_size: DEFAULT_COUNTER_SIZE,
            max_depth: DEFAULT_MAX_DEPTH,
            children_per_parent: DEFAULT_CHILDREN_PER_PARENT,
            mean_mutation_count: DEFAULT_MEAN_MUTATION_COUNT,
            mean_mutation_size: DEFAULT_MEAN_MUTATION_SIZE,
            max_fruitless_trials: DEFAULT_MAX_FRUITLESS_TRIALS,
        }
    }
}

impl ExecutionIndexingSettings {
    fn validate(&self) -> Result<(), GuidanceError> {
        let invalid = |what: &str| -> Result<(), GuidanceError> {
            Err(GuidanceError::InvalidArgument(what.to_string()))
        };
        if self.max_trials == 0 {
            return invalid("max trials must be positive");
        }
        if self.counter_size == 0 {
            return invalid("counter table size must be positive");
        }
        if self.max_depth == 0 {
            return invalid("max depth must be positive");
        }
        if self.children_per_parent == 0 {
            return invalid("children per parent must be positive");
        }
        if self.mean_mutation_count <= 1.0 || self.mean_mutation_size <= 1.0 {
            return invalid("mean mutation count and size must exceed one");
        }
        Ok(())
    }

    fn fresh_state(&self) -> ExecutionIndexingState {
        ExecutionIndexingState::with_limits(self.mode, self.counter_size, self.max_depth)
    }
}

/// State of the running trial, shared by the input reader and the event
/// sinks.
struct EiTrial {
    state: ExecutionIndexingState,
    input: IndexedInput,
    rng: ChaCha8Rng,
    run_coverage: Coverage,
    fatal: Option<IndexingError>,
    missing_instrumentation: bool,
}

/// Reads the bytes of an [`IndexedInput`], each keyed by the execution index
/// of the last event seen on the primary thread.
struct EiReader {
    trial: Arc<Mutex<EiTrial>>,
}

impl Read for EiReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = lock(&self.trial);
        let trial = &mut *guard;
        if let Some(e) = &trial.fatal {
            return Err(io::Error::other(e.to_string()));
        }
        let mut filled = 0;
        for slot in buf.iter_mut() {
            let Some(iid) = trial.state.last_event_iid() else {
                trial.missing_instrumentation = true;
                return Err(io::Error::other(GuidanceError::NoInstrumentation.to_string()));
            };
            let key = trial.state.execution_index_for(iid);
            match trial.input.get_or_generate_fresh(key, &mut trial.rng) {
                Some(value) => {
                    *slot = value;
                    filled += 1;
                }
                None => break,
            }
        }
        Ok(filled)
    }
}

/// Coverage-guided fuzzing over inputs addressed by execution index.
///
/// Seeds run first. After that each input is a mutated child of a saved
/// parent. An input that adds coverage is trimmed to the keys it actually
/// read and saved; it is favoured if it reached a location never covered
/// before.
pub struct ExecutionIndexingGuidance {
    settings: ExecutionIndexingSettings,
    trial: Arc<Mutex<EiTrial>>,
    rng: ChaCha8Rng,
    corpus: Box<dyn Corpus>,
    scheduler: CyclingScheduler,
    mutator: GeometricMutator,
    seeds: VecDeque<PathBuf>,
    total_coverage: Coverage,
    tracker: DiscardTracker,
    keep_going: bool,
}

impl ExecutionIndexingGuidance {
    pub fn new(
        settings: ExecutionIndexingSettings,
        seed: u64,
        corpus: Box<dyn Corpus>,
    ) -> Result<Self, GuidanceError> {
        settings.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let trial = EiTrial {
            state: settings.fresh_state(),
            input: IndexedInput::new(),
            rng: ChaCha8Rng::from_rng(&mut rng),
            run_coverage: Coverage::new(),
            fatal: None,
            missing_instrumentation: false,
        };
        Ok(Self {
            scheduler: CyclingScheduler::new(settings.children_per_parent),
            mutator: GeometricMutator {
                mean_mutation_count: settings.mean_mutation_count,
                mean_mutation_size: settings.mean_mutation_size,
            },
            settings,
            trial: Arc::new(Mutex::new(trial)),
            rng,
            corpus,
            seeds: VecDeque::new(),
            total_coverage: Coverage::new(),
            tracker: DiscardTracker::new(),
            keep_going: true,
        })
    }

    /// Files whose bytes are replayed, in order, before any mutation.
    pub fn with_seeds(mut self, seeds: impl IntoIterator<Item = PathBuf>) -> Self {
        self.seeds.extend(seeds);
        self
    }

    pub fn corpus(&self) -> &dyn Corpus {
        &*self.corpus
    }

    pub fn total_coverage(&self) -> &Coverage {
        &self.total_coverage
    }

    pub fn trials(&self) -> u64 {
        self.tracker.trials()
    }

    fn next_input(&mut self) -> Result<IndexedInput, GuidanceError> {
        if let Some(path) = self.seeds.pop_front() {
            let bytes = fs::read(&path)
                .map_err(|e| GuidanceError::io(format!("seed {}", path.display()), e))?;
            debug!("Running seed {} ({} bytes)", path.display(), bytes.len());
            return Ok(IndexedInput::from_seed(path, bytes));
        }
        if self.corpus.is_empty() {
            let trials = self.tracker.trials();
            if trials > self.settings.max_fruitless_trials {
                return Err(GuidanceError::TooManyFruitlessTrials(trials));
            }
            return Ok(IndexedInput::new());
        }
        let parent_id = self
            .scheduler
            .next(&*self.corpus, &mut self.rng)
            .map_err(|e| GuidanceError::IllegalState(e.to_string()))?;
        let parent = self
            .corpus
            .get(parent_id)
            .ok_or(GuidanceError::Corpus(CorpusError::InputNotFound(parent_id)))?;
        Ok(self.mutator.mutate(parent, &mut self.rng))
    }
}

impl Guidance for ExecutionIndexingGuidance {
    fn get_input(&mut self) -> Result<Box<dyn Read + Send>, GuidanceError> {
        let input = match self.next_input() {
            Ok(input) => input,
            Err(e) => {
                self.keep_going = false;
                return Err(e);
            }
        };
        {
            let mut trial = lock(&self.trial);
            trial.state = self.settings.fresh_state();
            trial.input = input;
            trial.rng = ChaCha8Rng::from_rng(&mut self.rng);
            trial.run_coverage.clear();
            trial.fatal = None;
            trial.missing_instrumentation = false;
        }
        Ok(Box::new(EiReader {
            trial: Arc::clone(&self.trial),
        }))
    }

    fn has_input(&mut self) -> bool {
        self.keep_going
    }

    fn handle_result(
        &mut self,
        result: TrialResult,
        error: Option<&TrialError>,
    ) -> Result<(), GuidanceError> {
        let tracked = self.tracker.record(result);
        let trial_number = self.tracker.trials();
        if trial_number >= self.settings.max_trials {
            self.keep_going = false;
        }

        let mut trial = lock(&self.trial);
        if let Some(e) = trial.fatal.take() {
            error!("Trial {trial_number}: {e}");
            self.keep_going = false;
            return Err(e.into());
        }
        if trial.missing_instrumentation {
            self.keep_going = false;
            return Err(GuidanceError::NoInstrumentation);
        }

        match result {
            TrialResult::Success => {
                let before = self.total_coverage.non_zero_count();
                if self.total_coverage.update_bits(&trial.run_coverage) {
                    let after = self.total_coverage.non_zero_count();
                    let mut input = mem::take(&mut trial.input);
                    input.gc();
                    input.set_favoured(after > before);
                    let id = match self.corpus.add(input, trial_number) {
                        Ok(id) => id,
                        Err(e) => {
                            self.keep_going = false;
                            return Err(e.into());
                        }
                    };
                    info!(
                        "Trial {trial_number}: saved input {id} (coverage {before} -> {after})"
                    );
                }
            }
            TrialResult::Failure => match error {
                Some(e) => warn!("Trial {trial_number} failed: {e}"),
                None => warn!("Trial {trial_number} failed"),
            },
            TrialResult::Invalid => debug!("Trial {trial_number} discarded"),
            TrialResult::Timeout => warn!("Trial {trial_number} timed out"),
        }
        drop(trial);

        if let Err(e) = tracked {
            error!("{e}");
            self.keep_going = false;
            return Err(e);
        }
        Ok(())
    }

    fn generate_callback(&mut self, thread: &TraceThread) -> EventCallback {
        let shared = Arc::clone(&self.trial);
        if thread.is_primary() {
            Box::new(move |event| {
                let mut trial = lock(&shared);
                trial.run_coverage.handle_event(event);
                if trial.fatal.is_none() {
                    if let Err(e) = trial.state.handle_event(event) {
                        trial.fatal = Some(e);
                    }
                }
            })
        } else {
            Box::new(move |event| lock(&shared).run_coverage.handle_event(event))
        }
    }
}

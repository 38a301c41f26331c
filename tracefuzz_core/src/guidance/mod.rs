//! Guidances decide which input each trial runs on and what to make of its
//! result.
//!
//! A guidance is driven as a single-consumer iterator of trials:
//! `has_input` → `get_input` → events flow into the sinks returned by
//! `generate_callback` while the target runs → `handle_result`. Once
//! `has_input` returns `false` it never returns `true` again.

mod afl;
mod diff;
mod ei;
mod no_guidance;
mod repro;

pub use afl::{AflGuidance, AflStatus};
pub use diff::{DiffNoGuidance, DiffReproGuidance, RecordedOutcome};
pub use ei::{ExecutionIndexingGuidance, ExecutionIndexingSettings};
pub use no_guidance::NoGuidance;
pub use repro::{ReproGuidance, ReproRecord, ReproServerGuidance};

use crate::corpus::CorpusError;
use crate::event::{EventCallback, TraceThread};
use crate::executor::{Executor, TrialReport};
use crate::indexing::IndexingError;
use crate::oracle::ComparisonError;
use crate::outcome::TrialError;
use std::fmt;
use std::io::{self, Read};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Ratio of INVALID trials above which a session is abandoned.
pub const MAX_DISCARD_RATIO: f64 = 0.9;
/// Number of trials that must run before the discard ratio is enforced.
pub const MIN_TRIALS_FOR_DISCARD_RATIO: u64 = 10;

/// Classification of a completed trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrialResult {
    Success,
    /// An assumption about the input was violated; the trial is discarded.
    Invalid,
    /// An assertion failed or the target threw.
    Failure,
    Timeout,
}

impl fmt::Display for TrialResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrialResult::Success => "SUCCESS",
            TrialResult::Invalid => "INVALID",
            TrialResult::Failure => "FAILURE",
            TrialResult::Timeout => "TIMEOUT",
        };
        f.write_str(name)
    }
}

/// Conditions that abort a fuzzing session. None of these are retried.
#[derive(Error, Debug)]
pub enum GuidanceError {
    #[error("I/O error on {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    /// The coprocess handshake was violated.
    #[error("Malformed coprocess handshake: {0}")]
    Handshake(String),
    #[error("Assumption is too strong; too many inputs discarded ({discards} of {trials} trials)")]
    AssumptionsTooStrong { trials: u64, discards: u64 },
    #[error("Execution indexing failed: {0}")]
    Indexing(#[from] IndexingError),
    #[error("Could not compute execution index; no instrumentation?")]
    NoInstrumentation,
    #[error("Illegal guidance state: {0}")]
    IllegalState(String),
    #[error("Invalid guidance argument: {0}")]
    InvalidArgument(String),
    #[error("Corpus error: {0}")]
    Corpus(#[from] CorpusError),
    #[error("Too many trials without coverage ({0}); likely all assumption violations")]
    TooManyFruitlessTrials(u64),
    #[error("A guidance is already bound to this session")]
    AlreadyBound,
    #[error("Outcome comparison failed: {0}")]
    Comparison(#[from] ComparisonError),
}

impl GuidanceError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        GuidanceError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Supplies trial inputs, consumes feedback and classifies results.
pub trait Guidance {
    /// Input bytes for the next trial.
    fn get_input(&mut self) -> Result<Box<dyn Read + Send>, GuidanceError>;

    /// Whether fuzzing should continue. Monotonic: once `false`, always
    /// `false`.
    fn has_input(&mut self) -> bool;

    /// Records the outcome of the trial that just ran.
    fn handle_result(
        &mut self,
        result: TrialResult,
        error: Option<&TrialError>,
    ) -> Result<(), GuidanceError>;

    /// The sink for trace events emitted by `thread` during the current trial.
    fn generate_callback(&mut self, thread: &TraceThread) -> EventCallback;

    /// Runs one trial. Guidances that need to observe or reclassify the
    /// target's outcome override this.
    fn run_trial(
        &mut self,
        executor: &mut dyn Executor,
        input: &mut dyn Read,
    ) -> Result<TrialReport, GuidanceError> {
        Ok(executor.execute(input, &mut |thread: &TraceThread| {
            self.generate_callback(thread)
        }))
    }
}

impl<G: Guidance + ?Sized> Guidance for Box<G> {
    fn get_input(&mut self) -> Result<Box<dyn Read + Send>, GuidanceError> {
        (**self).get_input()
    }

    fn has_input(&mut self) -> bool {
        (**self).has_input()
    }

    fn handle_result(
        &mut self,
        result: TrialResult,
        error: Option<&TrialError>,
    ) -> Result<(), GuidanceError> {
        (**self).handle_result(result, error)
    }

    fn generate_callback(&mut self, thread: &TraceThread) -> EventCallback {
        (**self).generate_callback(thread)
    }

    fn run_trial(
        &mut self,
        executor: &mut dyn Executor,
        input: &mut dyn Read,
    ) -> Result<TrialReport, GuidanceError> {
        (**self).run_trial(executor, input)
    }
}

impl<G: Guidance + ?Sized> Guidance for &mut G {
    fn get_input(&mut self) -> Result<Box<dyn Read + Send>, GuidanceError> {
        (**self).get_input()
    }

    fn has_input(&mut self) -> bool {
        (**self).has_input()
    }

    fn handle_result(
        &mut self,
        result: TrialResult,
        error: Option<&TrialError>,
    ) -> Result<(), GuidanceError> {
        (**self).handle_result(result, error)
    }

    fn generate_callback(&mut self, thread: &TraceThread) -> EventCallback {
        (**self).generate_callback(thread)
    }

    fn run_trial(
        &mut self,
        executor: &mut dyn Executor,
        input: &mut dyn Read,
    ) -> Result<TrialReport, GuidanceError> {
        (**self).run_trial(executor, input)
    }
}

/// Counts trials and discards, enforcing the maximum discard ratio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscardTracker {
    trials: u64,
    discards: u64,
}

impl DiscardTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trials(&self) -> u64 {
        self.trials
    }

    pub fn discards(&self) -> u64 {
        self.discards
    }

    /// Counts one trial. Fails once more than
    /// [`MIN_TRIALS_FOR_DISCARD_RATIO`] trials have run and more than
    /// [`MAX_DISCARD_RATIO`] of them were INVALID.
    pub fn record(&mut self, result: TrialResult) -> Result<(), GuidanceError> {
        self.trials += 1;
        if result == TrialResult::Invalid {
            self.discards += 1;
        }
        if self.trials > MIN_TRIALS_FOR_DISCARD_RATIO
            && (self.discards as f64) / (self.trials as f64) > MAX_DISCARD_RATIO
        {
            return Err(GuidanceError::AssumptionsTooStrong {
                trials: self.trials,
                discards: self.discards,
            });
        }
        Ok(())
    }
}

/// Locks state shared with event sinks. A sink that panicked mid-update
/// leaves counts that are still usable, so poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

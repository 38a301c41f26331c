use super::{DiscardTracker, Guidance, GuidanceError, TrialResult, lock};
use crate::coverage::Coverage;
use crate::event::{EventCallback, TraceThread};
use crate::input::RandomByteStream;
use crate::outcome::TrialError;
use log::{debug, error, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::io::Read;
use std::sync::{Arc, Mutex};

/// Unguided fuzzing: every trial reads a fresh pseudorandom stream and runs
/// until the trial budget is spent.
pub struct NoGuidance {
    max_trials: u64,
    rng: ChaCha8Rng,
    tracker: DiscardTracker,
    coverage: Arc<Mutex<Coverage>>,
    keep_going: bool,
    keep_going_on_failure: bool,
}

impl NoGuidance {
    pub fn new(max_trials: u64, seed: u64) -> Result<Self, GuidanceError> {
        if max_trials == 0 {
            return Err(GuidanceError::InvalidArgument(
                "max trials must be positive".to_string(),
            ));
        }
        Ok(Self {
            max_trials,
            rng: ChaCha8Rng::seed_from_u64(seed),
            tracker: DiscardTracker::new(),
            coverage: Arc::new(Mutex::new(Coverage::new())),
            keep_going: true,
            keep_going_on_failure: true,
        })
    }

    /// Whether a FAILURE ends the session.
    pub fn with_keep_going_on_failure(mut self, keep_going: bool) -> Self {
        self.keep_going_on_failure = keep_going;
        self
    }

    pub fn trials(&self) -> u64 {
        self.tracker.trials()
    }

    pub fn discards(&self) -> u64 {
        self.tracker.discards()
    }

    pub fn max_trials(&self) -> u64 {
        self.max_trials
    }

    /// Coverage accumulated over every trial so far.
    pub fn coverage(&self) -> Coverage {
        lock(&self.coverage).clone()
    }
}

impl Guidance for NoGuidance {
    fn get_input(&mut self) -> Result<Box<dyn Read + Send>, GuidanceError> {
        Ok(Box::new(RandomByteStream::new(ChaCha8Rng::from_rng(
            &mut self.rng,
        ))))
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
        match result {
            TrialResult::Failure => {
                match error {
                    Some(e) => warn!("Trial {} failed: {}", self.tracker.trials(), e),
                    None => warn!("Trial {} failed", self.tracker.trials()),
                }
                self.keep_going &= self.keep_going_on_failure;
            }
            TrialResult::Invalid => debug!("Trial {} discarded", self.tracker.trials()),
            TrialResult::Success | TrialResult::Timeout => {}
        }
        if self.tracker.trials() >= self.max_trials {
            self.keep_going = false;
        }
        if let Err(e) = tracked {
            error!("{e}");
            self.keep_going = false;
            return Err(e);
        }
        Ok(())
    }

    fn generate_callback(&mut self, _thread: &TraceThread) -> EventCallback {
        let coverage = Arc::clone(&self.coverage);
        Box::new(move |event| lock(&coverage).handle_event(event))
    }
}

use crate::executor::{Executor, TrialReport};
use crate::guidance::{Guidance, GuidanceError, TrialResult};
use log::{error, info};
use std::time::{Duration, Instant};

/// Trials between progress log lines.
const PROGRESS_INTERVAL: u64 = 1000;

/// Counts of trial results over one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub trials: u64,
    pub successes: u64,
    pub invalid: u64,
    pub failures: u64,
    pub timeouts: u64,
    /// `type: message` of every FAILURE and TIMEOUT, in trial order.
    pub failure_messages: Vec<String>,
    pub elapsed: Duration,
}

impl SessionSummary {
    fn record(&mut self, report: &TrialReport) {
        self.trials += 1;
        match report.result {
            TrialResult::Success => self.successes += 1,
            TrialResult::Invalid => self.invalid += 1,
            TrialResult::Failure => self.failures += 1,
            TrialResult::Timeout => self.timeouts += 1,
        }
        if matches!(report.result, TrialResult::Failure | TrialResult::Timeout) {
            let message = report
                .error
                .as_ref()
                .map_or_else(|| report.result.to_string(), ToString::to_string);
            self.failure_messages.push(message);
        }
    }

    pub fn execs_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.trials as f64 / secs
        } else {
            0.0
        }
    }
}

/// Assembles a [`FuzzSession`]. Exactly one guidance may be bound.
pub struct FuzzSessionBuilder<G, E> {
    guidance: Option<G>,
    executor: Option<E>,
}

impl<G, E> Default for FuzzSessionBuilder<G, E> {
    fn default() -> Self {
        Self {
            guidance: None,
            executor: None,
        }
    }
}

impl<G: Guidance, E: Executor> FuzzSessionBuilder<G, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_guidance(mut self, guidance: G) -> Result<Self, GuidanceError> {
        if self.guidance.is_some() {
            return Err(GuidanceError::AlreadyBound);
        }
        self.guidance = Some(guidance);
        Ok(self)
    }

    pub fn executor(mut self, executor: E) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> Result<FuzzSession<G, E>, GuidanceError> {
        let guidance = self
            .guidance
            .ok_or_else(|| GuidanceError::IllegalState("no guidance bound".to_string()))?;
        let executor = self
            .executor
            .ok_or_else(|| GuidanceError::IllegalState("no executor configured".to_string()))?;
        Ok(FuzzSession {
            guidance,
            executor,
            summary: SessionSummary::default(),
            terminated: false,
        })
    }
}

/// Drives trials through one guidance and one executor until the guidance
/// runs out of input or reports a fatal error.
pub struct FuzzSession<G, E> {
    guidance: G,
    executor: E,
    summary: SessionSummary,
    terminated: bool,
}

impl<G: Guidance, E: Executor> FuzzSession<G, E> {
    pub fn builder() -> FuzzSessionBuilder<G, E> {
        FuzzSessionBuilder::new()
    }

    /// Runs the trial loop. After the first return the session is terminated
    /// and later calls return the same summary without polling the guidance.
    pub fn run(&mut self) -> Result<SessionSummary, GuidanceError> {
        if self.terminated {
            return Ok(self.summary.clone());
        }
        let result = self.run_loop();
        self.terminated = true;
        if let Err(e) = &result {
            error!("Fuzzing aborted after {} trials: {e}", self.summary.trials);
        }
        result.map(|()| self.summary.clone())
    }

    fn run_loop(&mut self) -> Result<(), GuidanceError> {
        let start = Instant::now();
        let elapsed_before = self.summary.elapsed;
        while self.guidance.has_input() {
            let mut input = self.guidance.get_input()?;
            let report = self.guidance.run_trial(&mut self.executor, &mut input)?;
            self.summary.record(&report);
            self.summary.elapsed = elapsed_before + start.elapsed();
            self.guidance
                .handle_result(report.result, report.error.as_ref())?;

            if self.summary.trials % PROGRESS_INTERVAL == 0 {
                info!(
                    "Trials: {}, Failures: {}, Invalid: {}, Execs/sec: {:.2}",
                    self.summary.trials,
                    self.summary.failures,
                    self.summary.invalid,
                    self.summary.execs_per_sec()
                );
            }
        }
        self.summary.elapsed = elapsed_before + start.elapsed();
        info!(
            "Fuzzing finished: {} trials in {:.2?} ({} failures)",
            self.summary.trials, self.summary.elapsed, self.summary.failures
        );
        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn summary(&self) -> &SessionSummary {
        &self.summary
    }

    pub fn guidance(&self) -> &G {
        &self.guidance
    }

    pub fn into_parts(self) -> (G, E, SessionSummary) {
        (self.guidance, self.executor, self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventCallback, TraceThread, ignore_events};
    use crate::executor::{HarnessError, InProcessExecutor, TrialContext};
    use crate::guidance::NoGuidance;
    use crate::outcome::TrialError;
    use std::io::{self, Read};

    type FnExecutor =
        InProcessExecutor<fn(&mut TrialContext<'_, '_>) -> Result<Vec<u8>, HarnessError>>;

    fn byte_harness(ctx: &mut TrialContext<'_, '_>) -> Result<Vec<u8>, HarnessError> {
        let byte = ctx.read_u8()?;
        if byte == 0 {
            return Err(HarnessError::failed("ArithmeticException", "/ by zero"));
        }
        Ok(vec![100 / byte])
    }

    #[test]
    fn runs_until_guidance_is_exhausted() -> Result<(), GuidanceError> {
        let mut session = FuzzSession::builder()
            .bind_guidance(NoGuidance::new(5, 42)?)?
            .executor(InProcessExecutor::new("div", byte_harness))
            .build()?;
        let summary = session.run()?;
        assert_eq!(summary.trials, 5);
        assert_eq!(summary.successes + summary.failures, 5);
        assert_eq!(summary.failures as usize, summary.failure_messages.len());
        assert!(session.is_terminated());
        assert_eq!(session.guidance().trials(), 5);

        let again = session.run()?;
        assert_eq!(again.trials, 5);
        Ok(())
    }

    #[test]
    fn second_guidance_cannot_be_bound() -> Result<(), GuidanceError> {
        let builder = FuzzSessionBuilder::<NoGuidance, FnExecutor>::new()
            .bind_guidance(NoGuidance::new(1, 0)?)?;
        assert!(matches!(
            builder.bind_guidance(NoGuidance::new(1, 1)?),
            Err(GuidanceError::AlreadyBound)
        ));
        Ok(())
    }

    #[test]
    fn missing_parts_are_reported() -> Result<(), GuidanceError> {
        let builder = FuzzSessionBuilder::<NoGuidance, FnExecutor>::new()
            .bind_guidance(NoGuidance::new(1, 0)?)?;
        assert!(matches!(builder.build(), Err(GuidanceError::IllegalState(_))));
        Ok(())
    }

    #[test]
    fn fatal_guidance_error_terminates_the_session() -> Result<(), GuidanceError> {
        let mut session = FuzzSession::builder()
            .bind_guidance(NoGuidance::new(1000, 0)?)?
            .executor(InProcessExecutor::new(
                "never",
                |_ctx: &mut TrialContext<'_, '_>| -> Result<Vec<u8>, HarnessError> {
                    Err(HarnessError::Assumption("nothing fits".into()))
                },
            ))
            .build()?;
        assert!(matches!(
            session.run(),
            Err(GuidanceError::AssumptionsTooStrong { trials: 11, .. })
        ));
        assert!(session.is_terminated());
        assert_eq!(session.summary().invalid, 11);
        Ok(())
    }

    /// Panics if polled again after reporting that it is done.
    struct OneShot {
        done: bool,
        ran: bool,
    }

    impl Guidance for OneShot {
        fn get_input(&mut self) -> Result<Box<dyn Read + Send>, GuidanceError> {
            Ok(Box::new(io::repeat(7)))
        }

        fn has_input(&mut self) -> bool {
            assert!(!self.done, "polled after termination");
            if self.ran {
                self.done = true;
            }
            !self.done
        }

        fn handle_result(
            &mut self,
            _result: TrialResult,
            _error: Option<&TrialError>,
        ) -> Result<(), GuidanceError> {
            self.ran = true;
            Ok(())
        }

        fn generate_callback(&mut self, _thread: &TraceThread) -> EventCallback {
            ignore_events()
        }
    }

    #[test]
    fn terminated_session_never_polls_again() -> Result<(), GuidanceError> {
        let mut session = FuzzSession::builder()
            .bind_guidance(OneShot {
                done: false,
                ran: false,
            })?
            .executor(InProcessExecutor::new("div", byte_harness))
            .build()?;
        assert_eq!(session.run()?.successes, 1);
        assert_eq!(session.run()?.trials, 1);
        let (guidance, _executor, summary) = session.into_parts();
        assert!(guidance.done);
        assert_eq!(summary.failure_messages, Vec::<String>::new());
        Ok(())
    }
}

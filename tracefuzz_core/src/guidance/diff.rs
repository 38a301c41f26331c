//! Differential guidances: every trial runs on two variants of the target and
//! a divergence between their outcomes fails the trial.

use super::{Guidance, GuidanceError, NoGuidance, ReproGuidance, TrialResult};
use crate::event::{EventCallback, TraceThread, ignore_events};
use crate::executor::{Executor, TrialReport};
use crate::input::RecordingReader;
use crate::oracle::{self, Bytewise, CheckError, Comparison, Finding};
use crate::outcome::{Outcome, TrialError};
use log::warn;
use std::io::{Cursor, Read};

fn is_comparable(result: TrialResult) -> bool {
    matches!(result, TrialResult::Success | TrialResult::Failure)
}

/// Checks `report` against `expected`. A divergence is recorded as a finding
/// and turns the report into a FAILURE carrying the diff.
fn reconcile(
    report: TrialReport,
    expected: &Outcome,
    comparison: &dyn Comparison,
    trial: u64,
    input: &[u8],
    findings: &mut Vec<Finding>,
) -> Result<TrialReport, GuidanceError> {
    match oracle::check(expected, &report.outcome(), comparison) {
        Ok(()) => Ok(report),
        Err(CheckError::Diff(diff)) => {
            warn!("Trial {trial}: {diff}");
            let error = TrialError::from(&diff);
            findings.push(Finding::new(trial, input, diff));
            Ok(TrialReport::with_error(
                TrialResult::Failure,
                error,
                report.duration,
            ))
        }
        Err(CheckError::Comparison(e)) => Err(e.into()),
    }
}

/// Runs `executor` with the guidance's sinks and keeps a copy of the bytes
/// the target consumed.
fn run_recorded<G: Guidance + ?Sized>(
    guidance: &mut G,
    executor: &mut dyn Executor,
    input: &mut dyn Read,
) -> (TrialReport, Vec<u8>) {
    let mut recorder = RecordingReader::new(input);
    let report = executor.execute(&mut recorder, &mut |thread: &TraceThread| {
        guidance.generate_callback(thread)
    });
    (report, recorder.into_recorded())
}

/// Unguided differential fuzzing. The bytes consumed by the primary variant
/// are replayed against a reference variant.
pub struct DiffNoGuidance {
    inner: NoGuidance,
    reference: Box<dyn Executor + Send>,
    comparison: Box<dyn Comparison>,
    findings: Vec<Finding>,
    trials: u64,
}

impl DiffNoGuidance {
    pub fn new(inner: NoGuidance, reference: Box<dyn Executor + Send>) -> Self {
        Self {
            inner,
            reference,
            comparison: Box::new(Bytewise),
            findings: Vec::new(),
            trials: 0,
        }
    }

    pub fn with_comparison(mut self, comparison: Box<dyn Comparison>) -> Self {
        self.comparison = comparison;
        self
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn inner(&self) -> &NoGuidance {
        &self.inner
    }
}

impl Guidance for DiffNoGuidance {
    fn get_input(&mut self) -> Result<Box<dyn Read + Send>, GuidanceError> {
        self.inner.get_input()
    }

    fn has_input(&mut self) -> bool {
        self.inner.has_input()
    }

    fn handle_result(
        &mut self,
        result: TrialResult,
        error: Option<&TrialError>,
    ) -> Result<(), GuidanceError> {
        self.inner.handle_result(result, error)
    }

    fn generate_callback(&mut self, thread: &TraceThread) -> EventCallback {
        self.inner.generate_callback(thread)
    }

    fn run_trial(
        &mut self,
        executor: &mut dyn Executor,
        input: &mut dyn Read,
    ) -> Result<TrialReport, GuidanceError> {
        let trial = self.trials;
        self.trials += 1;
        let (report, consumed) = run_recorded(&mut self.inner, executor, input);
        if !is_comparable(report.result) {
            return Ok(report);
        }
        let expected = self
            .reference
            .execute(&mut Cursor::new(&consumed), &mut |_: &TraceThread| {
                ignore_events()
            });
        if !is_comparable(expected.result) {
            return Ok(report);
        }
        reconcile(
            report,
            &expected.outcome(),
            self.comparison.as_ref(),
            trial,
            &consumed,
            &mut self.findings,
        )
    }
}

/// How one replayed trial ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedOutcome {
    pub result: TrialResult,
    pub outcome: Outcome,
}

/// Replays inputs and remembers each trial's outcome. Given the outcomes of
/// an earlier replay of another variant, the i-th trial is checked against
/// the i-th reference outcome when both ended in SUCCESS or FAILURE.
pub struct DiffReproGuidance {
    inner: ReproGuidance,
    comparison: Box<dyn Comparison>,
    reference_outcomes: Option<Vec<RecordedOutcome>>,
    recent_outcomes: Vec<RecordedOutcome>,
    findings: Vec<Finding>,
}

impl DiffReproGuidance {
    pub fn new(inner: ReproGuidance) -> Self {
        Self {
            inner,
            comparison: Box::new(Bytewise),
            reference_outcomes: None,
            recent_outcomes: Vec::new(),
            findings: Vec::new(),
        }
    }

    pub fn with_comparison(mut self, comparison: Box<dyn Comparison>) -> Self {
        self.comparison = comparison;
        self
    }

    pub fn with_reference_outcomes(mut self, outcomes: Vec<RecordedOutcome>) -> Self {
        self.reference_outcomes = Some(outcomes);
        self
    }

    /// Outcomes of the trials run so far, in replay order.
    pub fn recent_outcomes(&self) -> &[RecordedOutcome] {
        &self.recent_outcomes
    }

    pub fn into_outcomes(self) -> Vec<RecordedOutcome> {
        self.recent_outcomes
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn repro(&self) -> &ReproGuidance {
        &self.inner
    }
}

impl Guidance for DiffReproGuidance {
    fn get_input(&mut self) -> Result<Box<dyn Read + Send>, GuidanceError> {
        self.inner.get_input()
    }

    fn has_input(&mut self) -> bool {
        self.inner.has_input()
    }

    fn handle_result(
        &mut self,
        result: TrialResult,
        error: Option<&TrialError>,
    ) -> Result<(), GuidanceError> {
        self.inner.handle_result(result, error)
    }

    fn generate_callback(&mut self, thread: &TraceThread) -> EventCallback {
        self.inner.generate_callback(thread)
    }

    fn run_trial(
        &mut self,
        executor: &mut dyn Executor,
        input: &mut dyn Read,
    ) -> Result<TrialReport, GuidanceError> {
        let trial = self.recent_outcomes.len();
        let (report, consumed) = run_recorded(&mut self.inner, executor, input);
        self.recent_outcomes.push(RecordedOutcome {
            result: report.result,
            outcome: report.outcome(),
        });

        let expected = self
            .reference_outcomes
            .as_ref()
            .and_then(|outcomes| outcomes.get(trial));
        match expected {
            Some(expected) if is_comparable(report.result) && is_comparable(expected.result) => {
                reconcile(
                    report,
                    &expected.outcome,
                    self.comparison.as_ref(),
                    trial as u64,
                    &consumed,
                    &mut self.findings,
                )
            }
            _ => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CallbackFactory, HarnessError, InProcessExecutor, TrialContext};
    use crate::oracle::{DIFF_ERROR_TYPE_NAME, Decoded, value_config};
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::tempdir;

    fn encode(value: i32) -> Vec<u8> {
        bincode::encode_to_vec(value, value_config()).expect("encode")
    }

    fn doubler() -> Box<dyn Executor + Send> {
        Box::new(InProcessExecutor::new(
            "double",
            |ctx: &mut TrialContext<'_, '_>| -> Result<Vec<u8>, HarnessError> {
                let n = i32::from(ctx.read_u8()?);
                Ok(encode(n * 2))
            },
        ))
    }

    /// Agrees with `doubler` except for inputs above 200.
    fn buggy_doubler(ctx: &mut TrialContext<'_, '_>) -> Result<Vec<u8>, HarnessError> {
        let n = i32::from(ctx.read_u8()?);
        if ctx.branch(1, n > 200) {
            return Ok(encode(n + n + 1));
        }
        Ok(encode(n * 2))
    }

    #[test]
    fn divergence_becomes_a_failure_with_a_finding() -> Result<(), GuidanceError> {
        let inner = NoGuidance::new(200, 5)?;
        let mut guidance = DiffNoGuidance::new(inner, doubler())
            .with_comparison(Box::new(Decoded::<i32>::new("i32")));
        let mut executor = InProcessExecutor::new("buggy", buggy_doubler);

        let mut failures = 0;
        while guidance.has_input() {
            let mut input = guidance.get_input()?;
            let report = guidance.run_trial(&mut executor, &mut input)?;
            if report.result == TrialResult::Failure {
                failures += 1;
                let error = report.error.as_ref().expect("failure carries an error");
                assert_eq!(error.type_name, DIFF_ERROR_TYPE_NAME);
            }
            guidance.handle_result(report.result, report.error.as_ref())?;
        }

        assert!(failures > 0, "no input above 200 in 200 random trials");
        assert_eq!(guidance.findings().len(), failures);
        let finding = &guidance.findings()[0];
        assert_eq!(finding.input_hash.len(), 32);
        assert!(matches!(finding.error.actual, Outcome::Returned(_)));
        Ok(())
    }

    #[test]
    fn agreeing_variants_pass() -> Result<(), GuidanceError> {
        let inner = NoGuidance::new(20, 1)?;
        let mut guidance = DiffNoGuidance::new(inner, doubler());
        let mut executor = doubler();
        while guidance.has_input() {
            let mut input = guidance.get_input()?;
            let report = guidance.run_trial(&mut executor, &mut input)?;
            assert_eq!(report.result, TrialResult::Success);
            guidance.handle_result(report.result, report.error.as_ref())?;
        }
        assert!(guidance.findings().is_empty());
        Ok(())
    }

    #[test]
    fn undecodable_output_is_a_comparison_error() -> Result<(), GuidanceError> {
        let inner = NoGuidance::new(1, 1)?;
        let mut guidance = DiffNoGuidance::new(inner, doubler())
            .with_comparison(Box::new(Decoded::<i32>::new("i32")));
        let mut executor = InProcessExecutor::new(
            "short",
            |ctx: &mut TrialContext<'_, '_>| -> Result<Vec<u8>, HarnessError> {
                ctx.read_u8()?;
                Ok(vec![1u8])
            },
        );
        let mut input = guidance.get_input()?;
        assert!(matches!(
            guidance.run_trial(&mut executor, &mut input),
            Err(GuidanceError::Comparison(_))
        ));
        Ok(())
    }

    fn write_inputs(dir: &std::path::Path, inputs: &[&[u8]]) -> Vec<PathBuf> {
        inputs
            .iter()
            .enumerate()
            .map(|(i, bytes)| {
                let path = dir.join(format!("input{i}"));
                fs::write(&path, bytes).expect("write input");
                path
            })
            .collect()
    }

    fn replay(
        guidance: &mut DiffReproGuidance,
        executor: &mut dyn Executor,
    ) -> Result<Vec<TrialResult>, GuidanceError> {
        let mut results = Vec::new();
        while guidance.has_input() {
            let mut input = guidance.get_input()?;
            let report = guidance.run_trial(executor, &mut input)?;
            guidance.handle_result(report.result, report.error.as_ref())?;
            results.push(report.result);
        }
        Ok(results)
    }

    #[test]
    fn repro_compares_against_reference_outcomes() -> Result<(), GuidanceError> {
        let dir = tempdir().map_err(|e| GuidanceError::io("tempdir", e))?;
        let paths = write_inputs(dir.path(), &[&[10], &[250], &[]]);

        let mut reference = DiffReproGuidance::new(ReproGuidance::new(paths.clone()));
        let mut reference_executor = doubler();
        let results = replay(&mut reference, &mut reference_executor)?;
        assert_eq!(
            results,
            vec![TrialResult::Success, TrialResult::Success, TrialResult::Invalid]
        );
        let outcomes = reference.into_outcomes();
        assert_eq!(outcomes.len(), 3);

        let mut candidate = DiffReproGuidance::new(ReproGuidance::new(paths))
            .with_comparison(Box::new(Decoded::<i32>::new("i32")))
            .with_reference_outcomes(outcomes);
        let mut executor = InProcessExecutor::new("buggy", buggy_doubler);
        let results = replay(&mut candidate, &mut executor)?;
        assert_eq!(
            results,
            vec![TrialResult::Success, TrialResult::Failure, TrialResult::Invalid]
        );
        assert_eq!(candidate.findings().len(), 1);
        assert_eq!(candidate.findings()[0].trial, 1);
        assert_eq!(
            candidate.findings()[0].input_hash,
            format!("{:x}", md5::compute([250u8]))
        );
        assert!(!candidate.repro().all_succeeded());
        Ok(())
    }

    fn echo(ctx: &mut TrialContext<'_, '_>) -> Result<Vec<u8>, HarnessError> {
        Ok(vec![ctx.read_u8()?])
    }

    /// Rejects input 7 as invalid, echoes everything else.
    fn picky_echo(ctx: &mut TrialContext<'_, '_>) -> Result<Vec<u8>, HarnessError> {
        let byte = ctx.read_u8()?;
        if byte == 7 {
            return Err(HarnessError::Assumption("seven".to_string()));
        }
        Ok(vec![byte])
    }

    /// Consumes one byte and reports the trial as timed out.
    struct Stalling;

    impl Executor for Stalling {
        fn execute(
            &mut self,
            input: &mut dyn Read,
            _callbacks: &mut CallbackFactory<'_>,
        ) -> TrialReport {
            let mut byte = [0u8; 1];
            let _ = input.read(&mut byte);
            TrialReport::with_error(
                TrialResult::Timeout,
                TrialError::new("Timeout", "trial exceeded its time limit"),
                Duration::from_secs(1),
            )
        }
    }

    #[test]
    fn invalid_reference_is_not_compared() -> Result<(), GuidanceError> {
        let rejecting: Box<dyn Executor + Send> = Box::new(InProcessExecutor::new(
            "reject",
            |ctx: &mut TrialContext<'_, '_>| -> Result<Vec<u8>, HarnessError> {
                ctx.read_u8()?;
                Err(HarnessError::Assumption("never valid".to_string()))
            },
        ));
        let mut guidance = DiffNoGuidance::new(NoGuidance::new(5, 3)?, rejecting);
        let mut executor = InProcessExecutor::new("echo", echo);
        while guidance.has_input() {
            let mut input = guidance.get_input()?;
            let report = guidance.run_trial(&mut executor, &mut input)?;
            assert_eq!(report.result, TrialResult::Success);
            guidance.handle_result(report.result, report.error.as_ref())?;
        }
        assert!(guidance.findings().is_empty());
        Ok(())
    }

    #[test]
    fn timed_out_trial_is_not_compared() -> Result<(), GuidanceError> {
        let mut guidance = DiffNoGuidance::new(NoGuidance::new(1, 3)?, doubler());
        let mut input = guidance.get_input()?;
        let report = guidance.run_trial(&mut Stalling, &mut input)?;
        assert_eq!(report.result, TrialResult::Timeout);
        assert!(guidance.findings().is_empty());
        Ok(())
    }

    #[test]
    fn repro_skips_inputs_the_reference_rejected() -> Result<(), GuidanceError> {
        let dir = tempdir().map_err(|e| GuidanceError::io("tempdir", e))?;
        let paths = write_inputs(dir.path(), &[&[7], &[8]]);

        let mut reference = DiffReproGuidance::new(ReproGuidance::new(paths.clone()));
        let results = replay(&mut reference, &mut InProcessExecutor::new("picky", picky_echo))?;
        assert_eq!(results, vec![TrialResult::Invalid, TrialResult::Success]);
        assert_eq!(reference.recent_outcomes()[0].result, TrialResult::Invalid);

        let mut candidate = DiffReproGuidance::new(ReproGuidance::new(paths))
            .with_reference_outcomes(reference.into_outcomes());
        let results = replay(&mut candidate, &mut InProcessExecutor::new("echo", echo))?;
        assert_eq!(results, vec![TrialResult::Success, TrialResult::Success]);
        assert!(candidate.findings().is_empty());
        assert!(candidate.repro().all_succeeded());
        Ok(())
    }

    #[test]
    fn repro_skips_timed_out_candidates() -> Result<(), GuidanceError> {
        let dir = tempdir().map_err(|e| GuidanceError::io("tempdir", e))?;
        let paths = write_inputs(dir.path(), &[&[3]]);

        let mut reference = DiffReproGuidance::new(ReproGuidance::new(paths.clone()));
        replay(&mut reference, &mut InProcessExecutor::new("echo", echo))?;

        let mut candidate = DiffReproGuidance::new(ReproGuidance::new(paths))
            .with_reference_outcomes(reference.into_outcomes());
        let results = replay(&mut candidate, &mut Stalling)?;
        assert_eq!(results, vec![TrialResult::Timeout]);
        assert!(candidate.findings().is_empty());
        Ok(())
    }
}

use super::{Guidance, GuidanceError, TrialResult, lock};
use crate::coverage::{COVERAGE_MAP_SIZE, Coverage};
use crate::event::{EventCallback, TraceThread};
use crate::outcome::TrialError;
use log::{debug, info, warn};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Result of replaying one input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReproRecord {
    pub path: PathBuf,
    pub result: TrialResult,
    pub error: Option<TrialError>,
}

/// Replays a fixed list of input files, each exactly once, and accumulates
/// the coverage of all of them.
pub struct ReproGuidance {
    inputs: Vec<PathBuf>,
    next: usize,
    running: bool,
    coverage: Arc<Mutex<Coverage>>,
    records: Vec<ReproRecord>,
    trace_dir: Option<PathBuf>,
}

impl ReproGuidance {
    pub fn new(inputs: Vec<PathBuf>) -> Self {
        Self {
            inputs,
            next: 0,
            running: false,
            coverage: Arc::new(Mutex::new(Coverage::new())),
            records: Vec::new(),
            trace_dir: None,
        }
    }

    /// Writes every trace event of every replayed input, one line per event,
    /// to a file per input and thread under `directory`.
    pub fn with_trace_dir(mut self, directory: impl Into<PathBuf>) -> Result<Self, GuidanceError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)
            .map_err(|e| GuidanceError::io(format!("trace directory {}", directory.display()), e))?;
        self.trace_dir = Some(directory);
        Ok(self)
    }

    pub fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    pub fn records(&self) -> &[ReproRecord] {
        &self.records
    }

    /// Index of the input currently being replayed, or of the next one.
    pub fn position(&self) -> usize {
        self.next
    }

    pub fn all_succeeded(&self) -> bool {
        self.records.iter().all(|r| r.result == TrialResult::Success)
    }

    /// Coverage accumulated over every input replayed so far.
    pub fn coverage(&self) -> Coverage {
        lock(&self.coverage).clone()
    }

    fn current_path(&self) -> Option<&Path> {
        self.inputs.get(self.next).map(PathBuf::as_path)
    }

    fn trace_writer(&self, thread: &TraceThread) -> Option<BufWriter<File>> {
        let directory = self.trace_dir.as_ref()?;
        let input_name = self
            .current_path()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("input{}", self.next));
        let path = directory.join(format!("{input_name}.{}-{}.trace", thread.name, thread.id));
        match File::create(&path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                warn!("Cannot write event trace to {}: {e}", path.display());
                None
            }
        }
    }
}

impl Guidance for ReproGuidance {
    fn get_input(&mut self) -> Result<Box<dyn Read + Send>, GuidanceError> {
        let Some(path) = self.current_path() else {
            return Err(GuidanceError::IllegalState(
                "every input has already been replayed".to_string(),
            ));
        };
        let file = File::open(path)
            .map_err(|e| GuidanceError::io(format!("input file {}", path.display()), e))?;
        self.running = true;
        Ok(Box::new(BufReader::new(file)))
    }

    fn has_input(&mut self) -> bool {
        self.next < self.inputs.len()
    }

    fn handle_result(
        &mut self,
        result: TrialResult,
        error: Option<&TrialError>,
    ) -> Result<(), GuidanceError> {
        let path = match self.current_path() {
            Some(path) if self.running => path.to_path_buf(),
            _ => {
                return Err(GuidanceError::IllegalState(
                    "result reported without a replayed input".to_string(),
                ));
            }
        };
        match (result, error) {
            (TrialResult::Failure, Some(e)) => warn!("{}: FAILURE ({e})", path.display()),
            (TrialResult::Success, _) => info!("{}: SUCCESS", path.display()),
            (result, _) => info!("{}: {result}", path.display()),
        }
        self.records.push(ReproRecord {
            path,
            result,
            error: error.cloned(),
        });
        self.running = false;
        self.next += 1;
        Ok(())
    }

    fn generate_callback(&mut self, thread: &TraceThread) -> EventCallback {
        let coverage = Arc::clone(&self.coverage);
        match self.trace_writer(thread) {
            Some(mut trace) => Box::new(move |event| {
                lock(&coverage).handle_event(event);
                if let Err(e) = writeln!(trace, "{event}") {
                    debug!("Dropping trace line: {e}");
                }
            }),
            None => Box::new(move |event| lock(&coverage).handle_event(event)),
        }
    }
}

/// Replays inputs named one per line on a command stream until it closes.
///
/// After each trial the coverage file is rewritten with the trial's covered
/// locations as zero-padded indices, one per line, ending with a line equal
/// to the coverage map size.
pub struct ReproServerGuidance<R> {
    commands: R,
    coverage_file: PathBuf,
    pending: Option<PathBuf>,
    running: bool,
    closed: bool,
    coverage: Arc<Mutex<Coverage>>,
    trials: u64,
}

impl ReproServerGuidance<BufReader<File>> {
    pub fn open(command_pipe: &Path, coverage_file: impl Into<PathBuf>) -> Result<Self, GuidanceError> {
        let file = File::open(command_pipe).map_err(|e| {
            GuidanceError::io(format!("command pipe {}", command_pipe.display()), e)
        })?;
        Ok(Self::new(BufReader::new(file), coverage_file))
    }
}

impl<R: BufRead> ReproServerGuidance<R> {
    pub fn new(commands: R, coverage_file: impl Into<PathBuf>) -> Self {
        Self {
            commands,
            coverage_file: coverage_file.into(),
            pending: None,
            running: false,
            closed: false,
            coverage: Arc::new(Mutex::new(Coverage::new())),
            trials: 0,
        }
    }

    pub fn trials(&self) -> u64 {
        self.trials
    }

    fn write_coverage(&self) -> std::io::Result<()> {
        let mut out = BufWriter::new(File::create(&self.coverage_file)?);
        for index in lock(&self.coverage).covered_indices() {
            writeln!(out, "{index:05}")?;
        }
        writeln!(out, "{COVERAGE_MAP_SIZE}")?;
        out.flush()
    }
}

impl<R: BufRead> Guidance for ReproServerGuidance<R> {
    fn get_input(&mut self) -> Result<Box<dyn Read + Send>, GuidanceError> {
        let Some(path) = self.pending.as_ref() else {
            return Err(GuidanceError::IllegalState(
                "no input path has been received".to_string(),
            ));
        };
        lock(&self.coverage).clear();
        let file = File::open(path)
            .map_err(|e| GuidanceError::io(format!("input file {}", path.display()), e))?;
        self.running = true;
        Ok(Box::new(BufReader::new(file)))
    }

    fn has_input(&mut self) -> bool {
        if self.closed {
            return false;
        }
        if self.pending.is_some() {
            return true;
        }
        let mut line = String::new();
        loop {
            line.clear();
            match self.commands.read_line(&mut line) {
                Ok(0) => {
                    info!("Command stream closed after {} trials", self.trials);
                    self.closed = true;
                    return false;
                }
                Ok(_) => {
                    let path = line.trim();
                    if !path.is_empty() {
                        self.pending = Some(PathBuf::from(path));
                        return true;
                    }
                }
                Err(e) => {
                    warn!("Failed to read command stream: {e}");
                    self.closed = true;
                    return false;
                }
            }
        }
    }

    fn handle_result(
        &mut self,
        result: TrialResult,
        error: Option<&TrialError>,
    ) -> Result<(), GuidanceError> {
        let path = match self.pending.take() {
            Some(path) if self.running => path,
            _ => {
                return Err(GuidanceError::IllegalState(
                    "result reported without a replayed input".to_string(),
                ));
            }
        };
        self.running = false;
        self.trials += 1;
        match error {
            Some(e) => info!("{}: {result} ({e})", path.display()),
            None => info!("{}: {result}", path.display()),
        }
        self.write_coverage().map_err(|e| {
            GuidanceError::io(format!("coverage file {}", self.coverage_file.display()), e)
        })
    }

    fn generate_callback(&mut self, _thread: &TraceThread) -> EventCallback {
        let coverage = Arc::clone(&self.coverage);
        Box::new(move |event| lock(&coverage).handle_event(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter;
    use crate::event::{SourceSite, TraceEvent};
    use crate::executor::{HarnessError, InProcessExecutor, TrialContext};
    use std::io::Cursor;
    use tempfile::tempdir;

    /// Calls site 10 for an even first byte and site 20 otherwise, and fails
    /// on `!`.
    fn parity_executor()
    -> InProcessExecutor<impl FnMut(&mut TrialContext<'_, '_>) -> Result<Vec<u8>, HarnessError>>
    {
        InProcessExecutor::new("parity", |ctx: &mut TrialContext<'_, '_>| {
            let byte = ctx.read_u8()?;
            if byte == b'!' {
                return Err(HarnessError::failed("IllegalArgumentException", "bang"));
            }
            let site = if byte % 2 == 0 { 10 } else { 20 };
            ctx.call(site, "visit", |_| ());
            Ok(vec![byte])
        })
    }

    fn replay_all(guidance: &mut dyn Guidance) -> Result<(), GuidanceError> {
        let mut executor = parity_executor();
        while guidance.has_input() {
            let mut input = guidance.get_input()?;
            let report = guidance.run_trial(&mut executor, &mut input)?;
            guidance.handle_result(report.result, report.error.as_ref())?;
        }
        Ok(())
    }

    #[test]
    fn replays_each_input_once_and_accumulates_coverage() -> Result<(), GuidanceError> {
        let dir = tempdir().map_err(|e| GuidanceError::io("tempdir", e))?;
        let paths: Vec<PathBuf> = [("a", b"2"), ("b", b"3"), ("c", b"!")]
            .iter()
            .map(|(name, bytes)| {
                let path = dir.path().join(name);
                fs::write(&path, bytes).expect("write input");
                path
            })
            .collect();

        let mut guidance = ReproGuidance::new(paths.clone());
        replay_all(&mut guidance)?;

        let results: Vec<TrialResult> = guidance.records().iter().map(|r| r.result).collect();
        assert_eq!(
            results,
            vec![TrialResult::Success, TrialResult::Success, TrialResult::Failure]
        );
        assert_eq!(guidance.records()[2].path, paths[2]);
        assert_eq!(
            guidance.records()[2].error.as_ref().map(|e| e.type_name.as_str()),
            Some("IllegalArgumentException")
        );
        assert!(!guidance.all_succeeded());
        assert_eq!(guidance.coverage().non_zero_count(), 2);
        assert!(!guidance.has_input());
        Ok(())
    }

    #[test]
    fn missing_input_file_is_an_io_error() {
        let mut guidance = ReproGuidance::new(vec![PathBuf::from("/nonexistent/tracefuzz/input")]);
        assert!(guidance.has_input());
        assert!(matches!(guidance.get_input(), Err(GuidanceError::Io { .. })));
    }

    #[test]
    fn trace_dir_receives_event_lines() -> Result<(), GuidanceError> {
        let dir = tempdir().map_err(|e| GuidanceError::io("tempdir", e))?;
        let input = dir.path().join("seed");
        fs::write(&input, b"4").map_err(|e| GuidanceError::io("seed", e))?;
        let traces = dir.path().join("traces");

        let mut guidance = ReproGuidance::new(vec![input]).with_trace_dir(&traces)?;
        replay_all(&mut guidance)?;

        let trace = fs::read_to_string(traces.join("seed.main-1.trace"))
            .map_err(|e| GuidanceError::io("trace", e))?;
        assert_eq!(trace.lines().count(), 2, "call and return: {trace}");
        Ok(())
    }

    #[test]
    fn server_replays_paths_until_the_stream_closes() -> Result<(), GuidanceError> {
        let dir = tempdir().map_err(|e| GuidanceError::io("tempdir", e))?;
        let even = dir.path().join("even");
        let odd = dir.path().join("odd");
        fs::write(&even, b"2").map_err(|e| GuidanceError::io("even", e))?;
        fs::write(&odd, b"3").map_err(|e| GuidanceError::io("odd", e))?;
        let coverage_file = dir.path().join("coverage.out");

        let commands = format!("{}\n\n{}\n", even.display(), odd.display());
        let mut guidance = ReproServerGuidance::new(Cursor::new(commands), &coverage_file);

        assert!(guidance.has_input());
        assert!(guidance.has_input(), "has_input must not consume a second path");
        let mut executor = parity_executor();
        let mut input = guidance.get_input()?;
        let report = guidance.run_trial(&mut executor, &mut input)?;
        guidance.handle_result(report.result, None)?;
        let first = fs::read_to_string(&coverage_file).map_err(|e| GuidanceError::io("cov", e))?;
        assert_eq!(first, format!("{:05}\n{}\n", counter::hash(10, COVERAGE_MAP_SIZE), COVERAGE_MAP_SIZE));

        replay_all(&mut guidance)?;
        let second = fs::read_to_string(&coverage_file).map_err(|e| GuidanceError::io("cov", e))?;
        assert_eq!(second, format!("{:05}\n{}\n", counter::hash(20, COVERAGE_MAP_SIZE), COVERAGE_MAP_SIZE));
        assert_eq!(guidance.trials(), 2);
        assert!(!guidance.has_input());
        Ok(())
    }

    #[test]
    fn server_rejects_results_without_a_path() {
        let mut guidance = ReproServerGuidance::new(Cursor::new(""), "unused");
        assert!(!guidance.has_input());
        assert!(matches!(
            guidance.handle_result(TrialResult::Success, None),
            Err(GuidanceError::IllegalState(_))
        ));
        let mut callback = guidance.generate_callback(&TraceThread::primary());
        callback(&TraceEvent::read(1, SourceSite::default()));
    }
}

use super::{Guidance, GuidanceError, TrialResult, lock};
use crate::coverage::{DEFAULT_TRACE_MAP_SIZE, TraceBits};
use crate::event::{EventCallback, TraceThread};
use crate::outcome::TrialError;
use crate::quiescence::QuiescenceBarrier;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Status word sent to the coprocess ahead of the trace bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AflStatus {
    Success,
    Failure,
    /// Reported as a success with an empty map, so the coprocess does not
    /// keep the input.
    Invalid,
    Timeout,
}

impl AflStatus {
    pub fn code(self) -> i32 {
        match self {
            AflStatus::Success | AflStatus::Invalid => 0,
            AflStatus::Failure => 1,
            AflStatus::Timeout => 9,
        }
    }
}

impl From<TrialResult> for AflStatus {
    fn from(result: TrialResult) -> Self {
        match result {
            TrialResult::Success => AflStatus::Success,
            TrialResult::Failure => AflStatus::Failure,
            TrialResult::Invalid => AflStatus::Invalid,
            TrialResult::Timeout => AflStatus::Timeout,
        }
    }
}

struct CoverageLog {
    writer: Box<dyn Write + Send>,
    covered: BTreeSet<usize>,
}

/// Bridges trials to an AFL-style coprocess that owns mutation and
/// scheduling.
///
/// Per trial the coprocess writes a 4-byte ready signal to `in_pipe` and
/// places the input in `input_file`; once the trial ends the guidance answers
/// on `out_pipe` with a little-endian `i32` status followed by the whole
/// trace-bits map.
pub struct AflGuidance<R, W> {
    input_file: PathBuf,
    in_pipe: R,
    out_pipe: W,
    trace_bits: Arc<Mutex<TraceBits>>,
    barrier: QuiescenceBarrier,
    everything_ok: bool,
    awaiting_result: bool,
    coverage_log: Option<CoverageLog>,
    run_timeout: Option<Duration>,
    run_start: Option<Instant>,
    trials: u64,
}

impl AflGuidance<File, File> {
    /// Opens the named pipes. Opening a FIFO blocks until the coprocess has
    /// opened the other end.
    pub fn open(
        input_file: impl Into<PathBuf>,
        in_pipe: &Path,
        out_pipe: &Path,
    ) -> Result<Self, GuidanceError> {
        let reader = File::open(in_pipe)
            .map_err(|e| GuidanceError::io(format!("input pipe {}", in_pipe.display()), e))?;
        let writer = OpenOptions::new()
            .write(true)
            .open(out_pipe)
            .map_err(|e| GuidanceError::io(format!("output pipe {}", out_pipe.display()), e))?;
        Ok(Self::new(input_file, reader, writer))
    }
}

impl<R: Read, W: Write> AflGuidance<R, W> {
    pub fn new(input_file: impl Into<PathBuf>, in_pipe: R, out_pipe: W) -> Self {
        Self {
            input_file: input_file.into(),
            in_pipe,
            out_pipe,
            trace_bits: Arc::new(Mutex::new(TraceBits::new(DEFAULT_TRACE_MAP_SIZE))),
            barrier: QuiescenceBarrier::new(),
            everything_ok: true,
            awaiting_result: false,
            coverage_log: None,
            run_timeout: None,
            run_start: None,
            trials: 0,
        }
    }

    pub fn with_map_size(self, map_size: usize) -> Result<Self, GuidanceError> {
        if map_size == 0 {
            return Err(GuidanceError::InvalidArgument(
                "trace map size must be positive".to_string(),
            ));
        }
        *lock(&self.trace_bits) = TraceBits::new(map_size);
        Ok(self)
    }

    /// Appends the edges first covered by each trial to `writer`, one index
    /// per line, followed by a line holding the map size.
    pub fn with_coverage_log(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.coverage_log = Some(CoverageLog {
            writer,
            covered: BTreeSet::new(),
        });
        self
    }

    /// Reports trials that run longer than `timeout` as TIMEOUT.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn trials(&self) -> u64 {
        self.trials
    }

    pub fn map_size(&self) -> usize {
        lock(&self.trace_bits).capacity()
    }

    pub fn out_pipe(&self) -> &W {
        &self.out_pipe
    }

    fn write_coverage_log(&mut self, bits: &TraceBits) -> io::Result<()> {
        let Some(log) = self.coverage_log.as_mut() else {
            return Ok(());
        };
        for index in bits.covered_indices() {
            if log.covered.insert(index) {
                writeln!(log.writer, "{index}")?;
            }
        }
        writeln!(log.writer, "{}", bits.capacity())?;
        log.writer.flush()
    }
}

fn send_feedback<W: Write>(out: &mut W, status: AflStatus, bits: &TraceBits) -> io::Result<()> {
    out.write_all(&status.code().to_le_bytes())?;
    out.write_all(bits.as_bytes())?;
    out.flush()
}

impl<R: Read, W: Write> Guidance for AflGuidance<R, W> {
    fn get_input(&mut self) -> Result<Box<dyn Read + Send>, GuidanceError> {
        if !self.everything_ok {
            return Err(GuidanceError::IllegalState(
                "coprocess bridge has shut down".to_string(),
            ));
        }
        if !self.awaiting_result {
            return Err(GuidanceError::Handshake(
                "input requested before a ready signal".to_string(),
            ));
        }
        let file = File::open(&self.input_file).map_err(|e| {
            GuidanceError::io(format!("input file {}", self.input_file.display()), e)
        })?;
        self.run_start = Some(Instant::now());
        Ok(Box::new(BufReader::new(file)))
    }

    fn has_input(&mut self) -> bool {
        if !self.everything_ok {
            return false;
        }
        if self.awaiting_result {
            return true;
        }
        let mut signal = [0u8; 4];
        match self.in_pipe.read_exact(&mut signal) {
            Ok(()) => {
                lock(&self.trace_bits).clear();
                self.awaiting_result = true;
                self.run_start = None;
                true
            }
            Err(e) => {
                if e.kind() == ErrorKind::UnexpectedEof {
                    info!("Coprocess closed the input pipe after {} trials", self.trials);
                } else {
                    warn!("Failed to read ready signal: {e}");
                }
                self.everything_ok = false;
                false
            }
        }
    }

    fn handle_result(
        &mut self,
        result: TrialResult,
        error: Option<&TrialError>,
    ) -> Result<(), GuidanceError> {
        if !self.awaiting_result {
            return Err(GuidanceError::Handshake(
                "result reported without a ready signal".to_string(),
            ));
        }
        self.awaiting_result = false;
        self.trials += 1;

        let timed_out = match (self.run_timeout, self.run_start.take()) {
            (Some(limit), Some(start)) => start.elapsed() > limit,
            _ => false,
        };
        let result = if timed_out { TrialResult::Timeout } else { result };
        if let (TrialResult::Failure, Some(e)) = (result, error) {
            debug!("Trial {} failed: {}", self.trials, e);
        }

        self.barrier.wait_for_quiescence();
        let status = AflStatus::from(result);
        let bits = {
            let mut bits = lock(&self.trace_bits);
            if status == AflStatus::Invalid {
                bits.clear_except_first();
            }
            bits.mark_instrumented();
            bits.clone()
        };

        if let Err(e) = send_feedback(&mut self.out_pipe, status, &bits) {
            self.everything_ok = false;
            return Err(GuidanceError::io("output pipe", e));
        }
        if let Err(e) = self.write_coverage_log(&bits) {
            self.everything_ok = false;
            return Err(GuidanceError::io("coverage log", e));
        }
        Ok(())
    }

    fn generate_callback(&mut self, _thread: &TraceThread) -> EventCallback {
        let bits = Arc::clone(&self.trace_bits);
        let barrier = self.barrier.clone();
        Box::new(move |event| {
            let _in_flight = barrier.enter();
            lock(&bits).handle_event(event);
        })
    }
}

use crate::event::{BranchArm, EventCallback, SourceSite, TraceEvent, TraceThread};
use crate::guidance::TrialResult;
use crate::outcome::{Outcome, TrialError};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile;
use thiserror::Error;

/// Type name reported for harness panics.
pub const PANIC_TYPE_NAME: &str = "panic";
/// Type name reported for violated assumptions.
pub const ASSUMPTION_TYPE_NAME: &str = "AssumptionViolated";

/// Produces the event sink for a thread the first time it emits an event.
pub type CallbackFactory<'c> = dyn FnMut(&TraceThread) -> EventCallback + 'c;

/// Classified result of one trial, as reported to a guidance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialReport {
    pub result: TrialResult,
    /// What the target threw, if anything.
    pub error: Option<TrialError>,
    /// Serialized value produced by a successful trial.
    pub output: Option<Vec<u8>>,
    pub duration: Duration,
}

impl TrialReport {
    pub fn success(output: Vec<u8>, duration: Duration) -> Self {
        Self {
            result: TrialResult::Success,
            error: None,
            output: Some(output),
            duration,
        }
    }

    pub fn with_error(result: TrialResult, error: TrialError, duration: Duration) -> Self {
        Self {
            result,
            error: Some(error),
            output: None,
            duration,
        }
    }

    pub fn outcome(&self) -> Outcome {
        match &self.error {
            Some(error) => Outcome::Threw(error.clone()),
            None => Outcome::Returned(self.output.clone().unwrap_or_default()),
        }
    }
}

/// Runs the target once per call.
pub trait Executor {
    /// Runs one trial reading its input from `input`. Trace events are
    /// delivered to sinks obtained from `callbacks`, one per thread.
    fn execute(&mut self, input: &mut dyn Read, callbacks: &mut CallbackFactory<'_>)
    -> TrialReport;
}

impl<E: Executor + ?Sized> Executor for Box<E> {
    fn execute(
        &mut self,
        input: &mut dyn Read,
        callbacks: &mut CallbackFactory<'_>,
    ) -> TrialReport {
        (**self).execute(input, callbacks)
    }
}

/// Ways an in-process harness reports a non-successful trial.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HarnessError {
    /// The input does not satisfy the harness's preconditions.
    #[error("Assumption violated: {0}")]
    Assumption(String),
    /// The target threw.
    #[error("{0}")]
    Failed(TrialError),
}

impl HarnessError {
    pub fn failed(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        HarnessError::Failed(TrialError::new(type_name, message))
    }
}

impl From<io::Error> for HarnessError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            HarnessError::Assumption("input exhausted".to_string())
        } else {
            HarnessError::failed("IOException", err.to_string())
        }
    }
}

/// Fails the trial as INVALID unless `condition` holds.
pub fn assume(condition: bool, what: &str) -> Result<(), HarnessError> {
    if condition {
        Ok(())
    } else {
        Err(HarnessError::Assumption(what.to_string()))
    }
}

/// What an in-process harness sees during one trial: the input stream and
/// the trace-event sinks.
pub struct TrialContext<'i, 'c> {
    input: &'i mut dyn Read,
    callbacks: &'c mut CallbackFactory<'c>,
    sinks: HashMap<u64, EventCallback>,
    primary: TraceThread,
    method: String,
}

impl<'i, 'c> TrialContext<'i, 'c> {
    pub fn new(
        input: &'i mut dyn Read,
        callbacks: &'c mut CallbackFactory<'c>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            input,
            callbacks,
            sinks: HashMap::new(),
            primary: TraceThread::primary(),
            method: method.into(),
        }
    }

    pub fn input(&mut self) -> &mut dyn Read {
        &mut *self.input
    }

    pub fn read_u8(&mut self) -> Result<u8, HarnessError> {
        let mut byte = [0u8; 1];
        self.input.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    /// Emits a read event at `iid` before reading one byte, so the byte can be
    /// attributed to that site.
    pub fn read_u8_at(&mut self, iid: i32) -> Result<u8, HarnessError> {
        let event = TraceEvent::read(iid, self.site(0));
        self.emit(event);
        self.read_u8()
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, HarnessError> {
        let mut bytes = vec![0u8; n];
        self.input.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32, HarnessError> {
        let mut bytes = [0u8; 4];
        self.input.read_exact(&mut bytes)?;
        Ok(i32::from_le_bytes(bytes))
    }

    /// Delivers `event` as if emitted by `thread`.
    pub fn emit_from(&mut self, thread: &TraceThread, event: &TraceEvent) {
        let callbacks = &mut *self.callbacks;
        let sink = self
            .sinks
            .entry(thread.id)
            .or_insert_with(|| callbacks(thread));
        sink(event);
    }

    /// Delivers `event` from the primary thread.
    pub fn emit(&mut self, event: TraceEvent) {
        let primary = self.primary.clone();
        self.emit_from(&primary, &event);
    }

    /// A dedicated sink for a thread the harness spawns itself.
    pub fn callback_for(&mut self, thread: &TraceThread) -> EventCallback {
        (self.callbacks)(thread)
    }

    fn site(&self, line: u32) -> SourceSite {
        SourceSite::new(self.method.clone(), line)
    }

    /// Emits a two-way branch at `iid` and returns `taken`.
    pub fn branch(&mut self, iid: i32, taken: bool) -> bool {
        let event = TraceEvent::branch(iid, self.site(0), BranchArm::Taken(taken));
        self.emit(event);
        taken
    }

    /// Emits a multi-way dispatch at `iid` and returns `arm`.
    pub fn switch(&mut self, iid: i32, arm: u32) -> u32 {
        let event = TraceEvent::branch(iid, self.site(0), BranchArm::Arm(arm));
        self.emit(event);
        arm
    }

    /// Runs `body` between a call and a return event for call site `iid`.
    pub fn call<T>(&mut self, iid: i32, callee: &str, body: impl FnOnce(&mut Self) -> T) -> T {
        let call = TraceEvent::call(iid, self.site(0), callee);
        self.emit(call);
        let value = body(self);
        let ret = TraceEvent::ret(iid, self.site(0), callee);
        self.emit(ret);
        value
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

/// Runs a harness function in the current process. Panics are caught and
/// reported as failures.
pub struct InProcessExecutor<F> {
    name: String,
    harness_fn: F,
}

impl<F> InProcessExecutor<F>
where
    F: FnMut(&mut TrialContext<'_, '_>) -> Result<Vec<u8>, HarnessError>,
{
    pub fn new(name: impl Into<String>, harness_fn: F) -> Self {
        Self {
            name: name.into(),
            harness_fn,
        }
    }
}

impl<F> Executor for InProcessExecutor<F>
where
    F: FnMut(&mut TrialContext<'_, '_>) -> Result<Vec<u8>, HarnessError>,
{
    fn execute(
        &mut self,
        input: &mut dyn Read,
        callbacks: &mut CallbackFactory<'_>,
    ) -> TrialReport {
        let start = Instant::now();
        let mut ctx = TrialContext::new(input, callbacks, self.name.clone());
        let harness = &mut self.harness_fn;
        let result = catch_unwind(AssertUnwindSafe(|| harness(&mut ctx)));
        drop(ctx);
        let elapsed = start.elapsed();

        match result {
            Ok(Ok(output)) => TrialReport::success(output, elapsed),
            Ok(Err(HarnessError::Assumption(what))) => {
                debug!("{}: assumption violated: {}", self.name, what);
                TrialReport::with_error(
                    TrialResult::Invalid,
                    TrialError::new(ASSUMPTION_TYPE_NAME, what),
                    elapsed,
                )
            }
            Ok(Err(HarnessError::Failed(err))) => {
                TrialReport::with_error(TrialResult::Failure, err, elapsed)
            }
            Err(payload) => TrialReport::with_error(
                TrialResult::Failure,
                TrialError::new(PANIC_TYPE_NAME, panic_message(payload)),
                elapsed,
            ),
        }
    }
}

pub enum InputDelivery {
    StdIn,
    /// Writes the input to a temporary file and substitutes its path for `{}`
    /// in the template, which is appended to the command line.
    File(String),
}

pub struct CommandExecutorConfig {
    pub command: Vec<String>,
    pub input_delivery: InputDelivery,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
    /// Upper bound on the bytes taken from a (possibly endless) input stream.
    pub max_input_len: usize,
}

enum WaitError {
    Timeout,
    Other(String),
}

/// Runs one program variant as a child process per trial. The child's
/// standard output is captured as the trial's serialized result; it cannot
/// emit trace events.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }

    fn run_and_wait_with_timeout(
        &self,
        child: &mut Child,
        timeout: Duration,
    ) -> Result<ExitStatus, WaitError> {
        let start_time = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start_time.elapsed() > timeout {
                        debug!("Target timed out, killing...");
                        if let Err(e) = child.kill() {
                            return Err(WaitError::Other(format!(
                                "Failed to kill timed-out process: {e}"
                            )));
                        }
                        let _ = child.wait();
                        return Err(WaitError::Timeout);
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => {
                    return Err(WaitError::Other(format!("Error waiting for child: {e}")));
                }
            }
        }
    }

    fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
        source.map(|mut source| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = source.read_to_end(&mut buf);
                buf
            })
        })
    }

    fn failure(type_name: &str, message: String, start: Instant) -> TrialReport {
        error!("{message}");
        TrialReport::with_error(
            TrialResult::Failure,
            TrialError::new(type_name, message),
            start.elapsed(),
        )
    }
}

fn exit_error(status: &ExitStatus, stderr: &[u8]) -> TrialError {
    let message = String::from_utf8_lossy(stderr).trim_end().to_string();
    if let Some(code) = status.code() {
        return TrialError::new(format!("exit:{code}"), message);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return TrialError::new(format!("signal:{signal}"), message);
        }
    }
    TrialError::new("exit:abnormal", message)
}

impl Executor for CommandExecutor {
    fn execute(
        &mut self,
        input: &mut dyn Read,
        _callbacks: &mut CallbackFactory<'_>,
    ) -> TrialReport {
        let start = Instant::now();

        let mut input_bytes = Vec::new();
        if let Err(e) =
            Read::take(&mut *input, self.config.max_input_len as u64).read_to_end(&mut input_bytes)
        {
            return Self::failure("IOException", format!("Failed to read trial input: {e}"), start);
        }

        let Some((program, args)) = self.config.command.split_first() else {
            return Self::failure("SpawnError", "Empty command line".to_string(), start);
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }

        let mut temp_file_handle: Option<tempfile::NamedTempFile> = None;
        match &self.config.input_delivery {
            InputDelivery::StdIn => {
                cmd.stdin(Stdio::piped());
            }
            InputDelivery::File(arg_template) => {
                let named_temp_file = match tempfile::NamedTempFile::new() {
                    Ok(f) => f,
                    Err(e) => {
                        return Self::failure(
                            "IOException",
                            format!("Failed to create temp file: {e}"),
                            start,
                        );
                    }
                };
                if let Err(e) =
                    File::create(named_temp_file.path()).and_then(|mut f| f.write_all(&input_bytes))
                {
                    return Self::failure(
                        "IOException",
                        format!(
                            "Failed to write to temp file {:?}: {}",
                            named_temp_file.path(),
                            e
                        ),
                        start,
                    );
                }
                let path_str = named_temp_file.path().to_string_lossy().to_string();
                for part in arg_template.replace("{}", &path_str).split_whitespace() {
                    cmd.arg(part);
                }
                cmd.stdin(Stdio::null());
                temp_file_handle = Some(named_temp_file);
            }
        }

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Self::failure(
                    "SpawnError",
                    format!("Failed to spawn command '{:?}': {}", self.config.command, e),
                    start,
                );
            }
        };

        let stdout_reader = Self::spawn_reader(child.stdout.take());
        let stderr_reader = Self::spawn_reader(child.stderr.take());

        if let Some(mut child_stdin) = child.stdin.take() {
            if let Err(e) = child_stdin.write_all(&input_bytes) {
                // The target may exit without consuming its input.
                if e.kind() != io::ErrorKind::BrokenPipe {
                    warn!("Error writing to child stdin: {e}");
                }
            }
        }

        let waited = self.run_and_wait_with_timeout(&mut child, self.config.timeout);
        drop(temp_file_handle);

        let status = match waited {
            Ok(status) => status,
            Err(WaitError::Timeout) => {
                return TrialReport::with_error(
                    TrialResult::Timeout,
                    TrialError::new(
                        "Timeout",
                        format!("Exceeded {} ms", self.config.timeout.as_millis()),
                    ),
                    start.elapsed(),
                );
            }
            Err(WaitError::Other(msg)) => return Self::failure("WaitError", msg, start),
        };

        let stdout = stdout_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if status.success() {
            TrialReport::success(stdout, start.elapsed())
        } else {
            TrialReport::with_error(
                TrialResult::Failure,
                exit_error(&status, &stderr),
                start.elapsed(),
            )
        }
    }
}

#[cfg(test)]
mod in_process_executor_tests {
    use super::*;
    use crate::event::{TraceEventKind, ignore_events};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    fn run<F>(executor: &mut InProcessExecutor<F>, bytes: &[u8]) -> TrialReport
    where
        F: FnMut(&mut TrialContext<'_, '_>) -> Result<Vec<u8>, HarnessError>,
    {
        let mut input = Cursor::new(bytes.to_vec());
        executor.execute(&mut input, &mut |_thread: &TraceThread| ignore_events())
    }

    #[test]
    fn successful_harness_returns_its_output() {
        let mut executor = InProcessExecutor::new("Echo::run", |ctx: &mut TrialContext<'_, '_>| {
            ctx.read_bytes(2)
        });
        let report = run(&mut executor, &[7, 8, 9]);
        assert_eq!(report.result, TrialResult::Success);
        assert_eq!(report.output, Some(vec![7, 8]));
        assert_eq!(report.outcome(), Outcome::Returned(vec![7, 8]));
    }

    #[test]
    fn exhausted_input_and_assumptions_are_invalid() {
        let mut executor =
            InProcessExecutor::new("Needy::run", |ctx: &mut TrialContext<'_, '_>| {
                let first = ctx.read_u8()?;
                assume(first != 0, "first byte must be non-zero")?;
                ctx.read_bytes(4)
            });
        assert_eq!(run(&mut executor, &[0]).result, TrialResult::Invalid);
        let short = run(&mut executor, &[1, 2]);
        assert_eq!(short.result, TrialResult::Invalid);
        assert_eq!(
            short.error.map(|e| e.type_name),
            Some(ASSUMPTION_TYPE_NAME.to_string())
        );
    }

    #[test]
    fn failures_carry_the_thrown_type() {
        let mut executor = InProcessExecutor::new("Thrower::run", |_ctx: &mut TrialContext<'_, '_>| {
            Err(HarnessError::failed("IllegalArgumentException", "nope"))
        });
        let report = run(&mut executor, &[]);
        assert_eq!(report.result, TrialResult::Failure);
        assert_eq!(
            report.outcome(),
            Outcome::Threw(TrialError::new("IllegalArgumentException", "nope"))
        );
    }

    #[test]
    fn in_process_executor_catches_panic() {
        let mut executor =
            InProcessExecutor::new("Panicky::run", |ctx: &mut TrialContext<'_, '_>| {
                if ctx.read_u8()? == 0xFF {
                    panic!("Boom!");
                }
                Ok(Vec::new())
            });
        let report = run(&mut executor, &[0xFF]);
        assert_eq!(report.result, TrialResult::Failure);
        let error = report.error.expect("panic should be reported");
        assert_eq!(error.type_name, PANIC_TYPE_NAME);
        assert!(error.message.contains("Boom!"));
    }

    #[test]
    fn events_reach_one_sink_per_thread() {
        let seen: Arc<Mutex<Vec<(String, i32)>>> = Arc::new(Mutex::new(Vec::new()));
        let mut created = Vec::new();
        let mut executor = InProcessExecutor::new("Traced::run", |ctx: &mut TrialContext<'_, '_>| {
            ctx.call(1, "Traced::helper", |ctx| ctx.branch(2, true));
            let worker = TraceThread::new(2, "worker");
            ctx.emit_from(&worker, &TraceEvent::read(3, SourceSite::default()));
            Ok(Vec::new())
        });
        let mut input = Cursor::new(Vec::new());
        let report = executor.execute(&mut input, &mut |thread: &TraceThread| -> EventCallback {
            created.push(thread.name.clone());
            let seen = Arc::clone(&seen);
            let name = thread.name.clone();
            Box::new(move |event: &TraceEvent| {
                seen.lock().unwrap().push((name.clone(), event.iid));
            })
        });
        assert_eq!(report.result, TrialResult::Success);
        assert_eq!(created, vec!["main".to_string(), "worker".to_string()]);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("main".to_string(), 1),
                ("main".to_string(), 2),
                ("main".to_string(), 1),
                ("worker".to_string(), 3),
            ]
        );
    }

    #[test]
    fn call_wraps_body_in_call_and_return() {
        let kinds: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_kinds = Arc::clone(&kinds);
        let mut executor = InProcessExecutor::new("Nested::run", |ctx: &mut TrialContext<'_, '_>| {
            ctx.call(5, "Nested::inner", |ctx| ctx.switch(6, 2));
            Ok(Vec::new())
        });
        let mut input = Cursor::new(Vec::new());
        executor.execute(&mut input, &mut |_thread: &TraceThread| -> EventCallback {
            let kinds = Arc::clone(&sink_kinds);
            Box::new(move |event: &TraceEvent| {
                let kind = match &event.kind {
                    TraceEventKind::Call { .. } => "call",
                    TraceEventKind::Return { .. } => "return",
                    TraceEventKind::Branch { .. } => "branch",
                    _ => "other",
                };
                kinds.lock().unwrap().push(kind.to_string());
            })
        });
        assert_eq!(*kinds.lock().unwrap(), vec!["call", "branch", "return"]);
    }
}

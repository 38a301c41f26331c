use crate::counter::NonZeroCachingCounter;
use crate::event::{TraceEvent, TraceEventKind};
use crate::execution_index::ExecutionIndex;
use serde::Deserialize;
use thiserror::Error;

/// Default size of each per-depth counter table. A prime, tuned empirically.
pub const DEFAULT_COUNTER_SIZE: usize = 6151;
/// Default ceiling on the tracked call-stack depth.
pub const DEFAULT_MAX_DEPTH: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexingError {
    /// The target recursed past the supported depth; indices can no longer be
    /// computed for this run.
    #[error("Very deep stack ({depth} frames, max {max}); cannot compute execution index")]
    StackDepthExceeded { depth: usize, max: usize },
    #[error("Return from call site {iid} with no active call frame")]
    ReturnWithoutCall { iid: i32 },
}

/// How `pop_return` treats returns that do not match the innermost frame.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IndexingMode {
    /// Assumes well-nested call/return pairs and pops exactly one frame.
    #[default]
    Strict,
    /// Lazily unwinds frames skipped by exceptional control flow until the
    /// innermost frame matches the returning call site.
    ResyncOnUnwind,
}

/// Per-run, per-thread state that turns call/return/event notifications into
/// [`ExecutionIndex`] values.
///
/// Each stack depth owns a fixed-size hashed counter table; the rolling buffer
/// holds the current `(call-site id, count)` pair for every depth. Cloning
/// yields a fully independent copy.
#[derive(Debug, Clone)]
pub struct ExecutionIndexingState {
    mode: IndexingMode,
    counter_size: usize,
    max_depth: usize,
    depth: usize,
    last_event_iid: Option<i32>,
    stack_of_counters: Vec<NonZeroCachingCounter>,
    rolling_index: Vec<i32>,
}

impl ExecutionIndexingState {
    pub fn new(mode: IndexingMode) -> Self {
        Self::with_limits(mode, DEFAULT_COUNTER_SIZE, DEFAULT_MAX_DEPTH)
    }

    pub fn with_limits(mode: IndexingMode, counter_size: usize, max_depth: usize) -> Self {
        assert!(max_depth > 0, "max_depth must be positive");
        Self {
            mode,
            counter_size,
            max_depth,
            depth: 0,
            last_event_iid: None,
            stack_of_counters: vec![NonZeroCachingCounter::new(counter_size)],
            rolling_index: vec![0; 2 * max_depth],
        }
    }

    pub fn mode(&self) -> IndexingMode {
        self.mode
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn last_event_iid(&self) -> Option<i32> {
        self.last_event_iid
    }

    pub fn set_last_event_iid(&mut self, iid: i32) {
        self.last_event_iid = Some(iid);
    }

    fn record(&mut self, iid: i32) -> i32 {
        // Subject to hash collisions in the per-depth table.
        let count = self.stack_of_counters[self.depth].increment(iid as i64);
        self.rolling_index[2 * self.depth] = iid;
        self.rolling_index[2 * self.depth + 1] = count;
        count
    }

    /// Enters a call made from call site `iid` at the current depth.
    pub fn push_call(&mut self, iid: i32) -> Result<(), IndexingError> {
        if self.depth + 1 >= self.max_depth {
            return Err(IndexingError::StackDepthExceeded {
                depth: self.depth + 1,
                max: self.max_depth,
            });
        }
        self.record(iid);
        self.depth += 1;
        if self.depth >= self.stack_of_counters.len() {
            self.stack_of_counters
                .push(NonZeroCachingCounter::new(self.counter_size));
        }
        Ok(())
    }

    /// Leaves the frame entered from call site `iid`.
    pub fn pop_return(&mut self, iid: i32) -> Result<(), IndexingError> {
        if self.mode == IndexingMode::ResyncOnUnwind {
            while self.depth > 0 && self.rolling_index[2 * (self.depth - 1)] != iid {
                self.stack_of_counters[self.depth].clear();
                self.depth -= 1;
            }
        }
        if self.depth == 0 {
            return Err(IndexingError::ReturnWithoutCall { iid });
        }
        self.stack_of_counters[self.depth].clear();
        self.depth -= 1;
        Ok(())
    }

    /// Records event `iid` at the current depth and returns the index of that
    /// event: `2 * (depth + 1)` integers.
    pub fn execution_index_for(&mut self, iid: i32) -> ExecutionIndex {
        self.record(iid);
        ExecutionIndex::from_snapshot(&self.rolling_index[..2 * (self.depth + 1)])
    }

    /// Index of the current call site (`2 * depth` integers) without recording
    /// a new event. `None` at depth zero, where there is no enclosing call.
    pub fn current_index(&self) -> Option<ExecutionIndex> {
        if self.depth == 0 {
            return None;
        }
        Some(ExecutionIndex::from_snapshot(
            &self.rolling_index[..2 * self.depth],
        ))
    }

    /// Applies one trace event: calls push, returns pop, every other event only
    /// updates the last-seen event id.
    pub fn handle_event(&mut self, event: &TraceEvent) -> Result<(), IndexingError> {
        match &event.kind {
            TraceEventKind::Call { .. } => {
                self.set_last_event_iid(event.iid);
                self.push_call(event.iid)
            }
            TraceEventKind::Return { .. } => {
                self.set_last_event_iid(event.iid);
                self.pop_return(event.iid)
            }
            TraceEventKind::Branch { arm } => {
                let iid = match self.mode {
                    IndexingMode::Strict => event.iid,
                    IndexingMode::ResyncOnUnwind => {
                        event.iid.wrapping_add(arm.arm_number() as i32)
                    }
                };
                self.set_last_event_iid(iid);
                Ok(())
            }
            TraceEventKind::Alloc { .. } | TraceEventKind::Read => {
                self.set_last_event_iid(event.iid);
                Ok(())
            }
        }
    }
}

impl Default for ExecutionIndexingState {
    fn default() -> Self {
        Self::new(IndexingMode::default())
    }
}

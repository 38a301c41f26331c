//! Built-in fuzz targets, registered as `class::method`.

use bincode::Encode;
use tracefuzz_core::event::{BranchArm, EventCallback, SourceSite, TraceEvent, TraceThread};
use tracefuzz_core::executor::{HarnessError, TrialContext, assume};
use tracefuzz_core::oracle::value_config;
use tracefuzz_core::queue::{BlockingQueue, SyncBlockingDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub type HarnessFn = fn(&mut TrialContext<'_, '_>) -> Result<Vec<u8>, HarnessError>;

const HARNESSES: &[(&str, HarnessFn)] = &[
    ("demo.Calculator::evaluate", calculator),
    ("demo.Sort::insertion", insertion_sort),
    ("demo.Sort::quick", quick_sort),
    ("demo.Pipeline::process", pipeline),
];

pub fn lookup(key: &str) -> Option<HarnessFn> {
    HARNESSES
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, harness)| *harness)
}

pub fn lookup_method(class: &str, method: &str) -> Option<HarnessFn> {
    lookup(&format!("{class}::{method}"))
}

pub fn names() -> impl Iterator<Item = &'static str> {
    HARNESSES.iter().map(|(name, _)| *name)
}

fn encode<T: Encode>(value: T) -> Result<Vec<u8>, HarnessError> {
    bincode::encode_to_vec(value, value_config())
        .map_err(|e| HarnessError::failed("EncodeError", e.to_string()))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Mul,
}

fn apply(
    ctx: &mut TrialContext<'_, '_>,
    op: Op,
    acc: i32,
    operand: i32,
) -> Result<i32, HarnessError> {
    let result = if ctx.branch(103, op == Op::Mul) {
        acc.checked_mul(operand)
    } else {
        acc.checked_add(operand)
    };
    result.ok_or_else(|| HarnessError::failed("ArithmeticException", "integer overflow"))
}

/// Evaluates a token stream of digits, `+` and `*` left to right.
fn calculator(ctx: &mut TrialContext<'_, '_>) -> Result<Vec<u8>, HarnessError> {
    let mut acc = 0i32;
    let mut op = Op::Add;
    let mut operands = 0;
    loop {
        let byte = ctx.read_u8_at(100)?;
        match ctx.switch(101, u32::from(byte % 4)) {
            0 => {
                let operand = i32::from(byte / 4 % 10) + 1;
                acc = ctx.call(102, "apply", |inner| apply(inner, op, acc, operand))?;
                operands += 1;
            }
            1 => op = Op::Add,
            2 => op = Op::Mul,
            _ => break,
        }
    }
    assume(operands > 0, "expression has no operands")?;
    encode(acc)
}

fn read_list(ctx: &mut TrialContext<'_, '_>) -> Result<Vec<u8>, HarnessError> {
    let len = ctx.read_u8_at(200)? % 16;
    (0..len).map(|_| ctx.read_u8_at(201)).collect()
}

fn insertion_sort(ctx: &mut TrialContext<'_, '_>) -> Result<Vec<u8>, HarnessError> {
    let mut values = read_list(ctx)?;
    for i in 1..values.len() {
        let mut j = i;
        while j > 0 && ctx.branch(210, values[j - 1] > values[j]) {
            values.swap(j - 1, j);
            j -= 1;
        }
    }
    encode(values)
}

fn quick(ctx: &mut TrialContext<'_, '_>, values: Vec<u8>) -> Vec<u8> {
    let Some((&pivot, rest)) = values.split_first() else {
        return values;
    };
    let mut less = Vec::new();
    let mut greater = Vec::new();
    for &value in rest {
        if ctx.branch(220, value < pivot) {
            less.push(value);
        } else if ctx.branch(221, value > pivot) {
            greater.push(value);
        }
    }
    let mut sorted = ctx.call(222, "quick", |inner| quick(inner, less));
    sorted.push(pivot);
    sorted.extend(ctx.call(223, "quick", |inner| quick(inner, greater)));
    sorted
}

/// Differs from `insertion_sort` on inputs with repeated values.
fn quick_sort(ctx: &mut TrialContext<'_, '_>) -> Result<Vec<u8>, HarnessError> {
    let values = read_list(ctx)?;
    let sorted = quick(ctx, values);
    encode(sorted)
}

enum Job {
    Item(u8),
    Stop,
}

const WORKER_POLL: Duration = Duration::from_millis(500);

/// Processes jobs until `Job::Stop`. An empty poll just polls again.
fn pipeline_worker(
    queue: &BlockingQueue<Job>,
    results: &SyncBlockingDeque<u8>,
    mut callback: EventCallback,
    poll: Duration,
) {
    let site = SourceSite::new("Pipeline::worker", 0);
    loop {
        let value = match queue.remove(poll) {
            Some(Job::Item(value)) => value,
            Some(Job::Stop) => break,
            None => continue,
        };
        let even = value % 2 == 0;
        callback(&TraceEvent::branch(310, site.clone(), BranchArm::Taken(even)));
        if even {
            results.put_last(value / 2);
        } else {
            results.put_first(value);
        }
    }
}

/// Hands bytes to a worker thread, which halves even values and returns odd
/// ones unchanged to the front of the result deque.
fn pipeline(ctx: &mut TrialContext<'_, '_>) -> Result<Vec<u8>, HarnessError> {
    let count = usize::from(ctx.read_u8_at(300)? % 8);
    let mut jobs = Vec::with_capacity(count);
    for _ in 0..count {
        jobs.push(ctx.read_u8_at(301)?);
    }

    let queue = BlockingQueue::new(count + 1);
    let results: Arc<SyncBlockingDeque<u8>> = Arc::new(SyncBlockingDeque::new(count.max(1)));
    let callback = ctx.callback_for(&TraceThread::new(2, "pipeline-worker"));
    let worker = {
        let queue = queue.clone();
        let results = Arc::clone(&results);
        thread::spawn(move || pipeline_worker(&queue, &results, callback, WORKER_POLL))
    };

    for value in jobs {
        queue.put(Job::Item(value));
    }
    queue.put(Job::Stop);
    worker
        .join()
        .map_err(|_| HarnessError::failed("panic", "pipeline worker panicked"))?;

    let mut processed = Vec::with_capacity(count);
    while let Some(value) = results.poll_first(Duration::ZERO) {
        processed.push(value);
    }
    if processed.len() != count {
        return Err(HarnessError::failed(
            "IllegalStateException",
            format!("{} of {count} results lost", count - processed.len()),
        ));
    }
    encode(processed)
}

pub mod config;
pub mod corpus;
pub mod counter;
pub mod coverage;
pub mod event;
pub mod execution_index;
pub mod executor;
pub mod guidance;
pub mod indexing;
pub mod input;
pub mod mutator;
pub mod oracle;
pub mod outcome;
pub mod queue;
pub mod quiescence;
pub mod scheduler;
pub mod session;

pub use config::TraceFuzzConfig;
pub use corpus::{Corpus, CorpusError, InMemoryCorpus, OnDiskCorpus};
pub use coverage::{Coverage, TraceBits};
pub use event::{EventCallback, TraceEvent, TraceThread};
pub use execution_index::ExecutionIndex;
pub use executor::{CommandExecutor, Executor, InProcessExecutor, TrialContext, TrialReport};
pub use guidance::{Guidance, GuidanceError, TrialResult};
pub use indexing::{ExecutionIndexingState, IndexingError, IndexingMode};
pub use input::IndexedInput;
pub use mutator::{GeometricMutator, Mutator};
pub use oracle::{Comparison, DiffError, Finding};
pub use outcome::{Outcome, TrialError};
pub use scheduler::{CyclingScheduler, SchedulerError};
pub use session::{FuzzSession, FuzzSessionBuilder, SessionSummary};

use std::fmt;

/// Name of the thread whose events drive structural execution indexing.
pub const PRIMARY_THREAD_NAME: &str = "main";

/// Where an event happened in the instrumented program.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceSite {
    /// Identity of the method enclosing the event.
    pub containing_method: String,
    pub line: u32,
}

impl SourceSite {
    pub fn new(containing_method: impl Into<String>, line: u32) -> Self {
        Self {
            containing_method: containing_method.into(),
            line,
        }
    }
}

/// Direction taken at a branch instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchArm {
    /// A two-way conditional jump.
    Taken(bool),
    /// The arm selected by a multi-way dispatch.
    Arm(u32),
}

impl BranchArm {
    /// Numeric arm used by hashed coverage maps: `0`/`1` for not-taken/taken,
    /// `1 + arm` for multi-way dispatch.
    pub fn arm_number(self) -> i64 {
        match self {
            BranchArm::Taken(false) => 0,
            BranchArm::Taken(true) => 1,
            BranchArm::Arm(arm) => 1 + arm as i64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEventKind {
    Call { invoked_method: String },
    Return { invoked_method: String },
    Branch { arm: BranchArm },
    Alloc { count: u32 },
    Read,
}

/// A single observed occurrence during target execution, as emitted by the
/// instrumentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    /// Opaque call-site / instruction identifier.
    pub iid: i32,
    pub site: SourceSite,
    pub kind: TraceEventKind,
}

impl TraceEvent {
    pub fn call(iid: i32, site: SourceSite, invoked_method: impl Into<String>) -> Self {
        Self {
            iid,
            site,
            kind: TraceEventKind::Call {
                invoked_method: invoked_method.into(),
            },
        }
    }

    pub fn ret(iid: i32, site: SourceSite, invoked_method: impl Into<String>) -> Self {
        Self {
            iid,
            site,
            kind: TraceEventKind::Return {
                invoked_method: invoked_method.into(),
            },
        }
    }

    pub fn branch(iid: i32, site: SourceSite, arm: BranchArm) -> Self {
        Self {
            iid,
            site,
            kind: TraceEventKind::Branch { arm },
        }
    }

    pub fn alloc(iid: i32, site: SourceSite, count: u32) -> Self {
        Self {
            iid,
            site,
            kind: TraceEventKind::Alloc { count },
        }
    }

    pub fn read(iid: i32, site: SourceSite) -> Self {
        Self {
            iid,
            site,
            kind: TraceEventKind::Read,
        }
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match &self.kind {
            TraceEventKind::Call { invoked_method } => format!("CALL {invoked_method}"),
            TraceEventKind::Return { invoked_method } => format!("RETURN {invoked_method}"),
            TraceEventKind::Branch { arm } => format!("BRANCH {}", arm.arm_number()),
            TraceEventKind::Alloc { count } => format!("ALLOC {count}"),
            TraceEventKind::Read => "READ".to_string(),
        };
        write!(
            f,
            "{}#{} {}:{}",
            what, self.iid, self.site.containing_method, self.site.line
        )
    }
}

/// Identity of an application thread producing trace events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceThread {
    pub id: u64,
    pub name: String,
}

impl TraceThread {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn primary() -> Self {
        Self::new(1, PRIMARY_THREAD_NAME)
    }

    pub fn is_primary(&self) -> bool {
        self.name == PRIMARY_THREAD_NAME
    }
}

/// A per-thread sink that trace events are pushed into while a trial runs.
pub type EventCallback = Box<dyn FnMut(&TraceEvent) + Send>;

/// A callback that drops every event.
pub fn ignore_events() -> EventCallback {
    Box::new(|_event: &TraceEvent| {})
}

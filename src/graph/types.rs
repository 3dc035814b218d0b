//! Static types of the compiled process graph.

use petgraph::stable_graph::{EdgeIndex, NodeIndex};

/// A node of the compiled process graph.
#[derive(Debug, Clone)]
pub struct Activity {
    /// Activity ID, unique within one graph.
    pub id: String,

    /// Human-readable name, defaults to the ID.
    pub name: String,

    /// Whether the activity is a scope boundary (sub-process, event
    /// sub-process). Scope activities own a scope execution at runtime and
    /// are cancellable as a unit.
    pub is_scope: bool,

    /// Whether instantiating this activity cancels the owning scope
    /// (boundary-event style modification targets).
    pub is_cancel_scope: bool,

    /// Whether entering this activity interrupts the owning scope
    /// (interrupting event sub-process start, terminate end).
    pub is_interrupt_scope: bool,

    /// Whether execution of this activity crosses a transaction boundary:
    /// instead of executing inline, a job is created and a worker resumes
    /// the execution later.
    pub is_async: bool,

    /// ID of the enclosing scope activity; `None` means the process root.
    pub parent_scope: Option<String>,

    /// Capability-tagged behavior, selected at graph-build time.
    pub behavior: Behavior,

    /// Declared error handlers of this scope (matched by code, `None` is a
    /// catch-all). Only meaningful on scope activities and the process root.
    pub error_handlers: Vec<ErrorHandler>,

    /// Priority assigned to jobs created for this activity.
    pub job_priority: i64,
}

/// An edge of the compiled process graph.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Transition ID, unique within one graph.
    pub id: String,

    /// Source activity ID.
    pub source: String,

    /// Destination activity ID.
    pub destination: String,
}

/// A declared error (or escalation) handler attached to a scope.
#[derive(Debug, Clone)]
pub struct ErrorHandler {
    /// Error code this handler catches; `None` catches every code.
    pub error_code: Option<String>,

    /// Activity that receives control when the handler matches.
    pub handler: String,
}

impl ErrorHandler {
    pub fn matches(&self, code: &str) -> bool {
        match &self.error_code {
            Some(declared) => declared == code,
            None => true,
        }
    }
}

/// Capability-tagged behavior of one activity.
///
/// The engine dispatches on this via `match`; there is no behavior
/// inheritance. The variant is selected once, when the graph is compiled.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Leave through the default outgoing transition as soon as entered.
    Automatic,

    /// Wait state: stays until an external signal, then leaves.
    Wait,

    /// Timer wait state: schedules a timer job due after `delay_ms`; the
    /// firing job signals the execution. With `repeat`, the job is
    /// re-scheduled after every firing.
    Timer { delay_ms: i64, repeat: Option<i64> },

    /// Parallel split: one concurrent execution per outgoing transition.
    ParallelFork,

    /// Parallel join: waits until every incoming transition has arrived,
    /// then merges the branches and leaves once.
    ParallelJoin,

    /// Scope entry that continues at `initial` inside the scope.
    EmbeddedSubprocess { initial: String },

    /// Start activity of an event sub-process; entered via instantiation.
    EventSubprocessStart,

    /// Starts an instance of another deployed graph and waits for it; the
    /// sub instance carries a back link to this execution.
    CallActivity { process_key: String },

    /// Raises a declared process error with the given code.
    ThrowError { code: String },

    /// Ends the execution; completion propagates to the parent scope.
    End,

    /// Terminate end: interrupts the enclosing scope, then ends it.
    TerminateEnd,
}

/// Activity ID to petgraph NodeIndex map.
pub type ActivityIndexMap = std::collections::HashMap<String, NodeIndex>;

/// Transition ID to petgraph EdgeIndex map.
pub type TransitionIndexMap = std::collections::HashMap<String, EdgeIndex>;

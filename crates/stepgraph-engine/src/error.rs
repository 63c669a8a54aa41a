use std::time::Duration;

use thiserror::Error;

use stepgraph_core::StepGraphError;

use crate::record::Record;
use crate::schema::FieldKind;

/// A value or declaration that does not fit the record schema.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchemaError {
    #[error("field '{0}' is declared more than once")]
    DuplicateField(String),

    #[error("append field '{0}' must be declared as a list")]
    AppendNotList(String),

    #[error("default for field '{field}' is not a {expected}")]
    BadDefault { field: String, expected: FieldKind },

    #[error("initial values must be a JSON object")]
    NotAnObject,

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("field '{field}' expects {expected}, got {found}")]
    KindMismatch {
        field: String,
        expected: FieldKind,
        found: &'static str,
    },
}

/// Malformed graph declaration. Always fatal at `build()`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BuildError {
    #[error("invalid schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("step '{0}' is declared more than once")]
    DuplicateStep(String),

    #[error("'{0}' is a reserved marker and cannot name a step")]
    ReservedName(String),

    #[error("edge {from} -> {to} references unknown step '{missing}'")]
    UnknownStep {
        from: String,
        to: String,
        missing: String,
    },

    #[error("the end marker cannot have outgoing edges (edge to '{0}')")]
    EdgeFromEnd(String),

    #[error("the start marker cannot have incoming edges (edge from '{0}')")]
    EdgeToStart(String),

    #[error("edge {from} -> {to} is declared twice")]
    DuplicateEdge { from: String, to: String },

    #[error("the start marker has no outgoing edge")]
    NoEntry,

    #[error("router '{0}' cannot have unconditional edges")]
    RouterWithEdge(String),

    #[error("router '{0}' declares no tags")]
    EmptyRouter(String),

    #[error("router '{router}' declares tag '{tag}' twice")]
    DuplicateRouteTag { router: String, tag: String },

    #[error("router '{router}' maps undeclared tag '{tag}'")]
    UnknownRouteTag { router: String, tag: String },

    #[error("router '{router}' has no route for tag '{tag}' and no default")]
    UncoveredTag { router: String, tag: String },

    #[error("router '{router}' routes to unknown step '{target}'")]
    UnknownRouteTarget { router: String, target: String },

    #[error("step '{0}' is not reachable from the start marker")]
    Unreachable(String),

    #[error("the end marker is not reachable from the start marker")]
    EndUnreachable,

    #[error("join '{step}' declares predecessors {declared:?} but its forward edges come from {inferred:?}")]
    JoinMismatch {
        step: String,
        declared: Vec<String>,
        inferred: Vec<String>,
    },
}

/// Failure raised by a single step body.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Generation(#[from] StepGraphError),

    #[error("invalid update: {0}")]
    InvalidUpdate(SchemaError),

    #[error("router returned '{value}', which has no route")]
    RouterMismatch { value: String },

    #[error("{0}")]
    Failed(String),
}

impl StepError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Why a run did not reach the end marker.
///
/// Every variant past input validation carries the record as it stood when
/// the run stopped. For a step failure that is the snapshot the failing
/// step was given.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid initial record: {0}")]
    InvalidInput(SchemaError),

    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        record: Record,
        #[source]
        source: StepError,
    },

    #[error("run timed out after {after:?}")]
    TimedOut { after: Duration, record: Record },

    #[error("run was cancelled")]
    Cancelled { record: Record },

    #[error("run stalled before reaching the end; joins still waiting: {pending:?}")]
    Stalled { pending: Vec<String>, record: Record },

    #[error("run exceeded its limit of {limit} step executions")]
    StepLimitExceeded { limit: usize, record: Record },
}

impl RunError {
    /// Name of the step whose body failed, if a step failure ended the run.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::StepFailed { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Record carried by the failure report.
    pub fn record(&self) -> Option<&Record> {
        match self {
            Self::InvalidInput(_) => None,
            Self::StepFailed { record, .. }
            | Self::TimedOut { record, .. }
            | Self::Cancelled { record }
            | Self::Stalled { record, .. }
            | Self::StepLimitExceeded { record, .. } => Some(record),
        }
    }

    /// The text-generation error behind a step failure, if any.
    pub fn generation_error(&self) -> Option<&StepGraphError> {
        match self {
            Self::StepFailed {
                source: StepError::Generation(e),
                ..
            } => Some(e),
            _ => None,
        }
    }
}

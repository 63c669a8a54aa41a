//! The four demo workflows.
//!
//! Each module exposes the record `schema()`, the built `graph()`, an input
//! type validated before anything runs, an output type read back from the
//! final record, and a `run` entry point.
//!
//! | app | graph shape |
//! |-----|-------------|
//! | [`review`] | classify, branch, converge on the end marker |
//! | [`tweet`] | generate, evaluate, loop back until approved or out of iterations |
//! | [`essay`] | three evaluators in parallel, joined into one summary |
//! | [`quadratic`] | pure arithmetic with a three-way router |

pub mod essay;
pub mod quadratic;
pub mod review;
pub mod tweet;

use thiserror::Error;

use stepgraph_engine::{BuildError, RunError, RunOutcome};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("graph declaration is invalid: {0}")]
    Build(#[from] BuildError),

    #[error(transparent)]
    Run(#[from] RunError),
}

/// An app's typed output plus the run that produced it.
#[derive(Debug, Clone)]
pub struct AppRun<T> {
    pub output: T,
    pub outcome: RunOutcome,
}

pub(crate) fn str_field(record: &stepgraph_engine::Record, key: &str) -> String {
    record.get_str(key).unwrap_or_default().to_string()
}

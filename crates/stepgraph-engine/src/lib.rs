//! Step-graph execution engine.
//!
//! A graph is a set of named steps over a typed [`Record`]. Transforms read
//! a snapshot of the record and return a [`PartialUpdate`]; routers read it
//! and pick the next step. Edges from one step to several others fan out,
//! a step with several forward predecessors joins them, and routers may
//! send the run back to an earlier step.
//!
//! Runs proceed in waves: every step in the ready queue sees the same
//! snapshot, and results merge in queue order.
//!
//! ```ignore
//! let mut g = GraphBuilder::new(schema);
//! g.add_transform("double", double)
//!     .add_edge(START, "double")
//!     .add_edge("double", END);
//! let graph = g.build()?;
//! let outcome = graph.run(json!({"n": 2}), generator, RunOptions::default()).await?;
//! ```

pub mod error;
pub mod executor;
pub mod graph;
pub mod record;
pub mod schema;
pub mod step;

pub use error::{BuildError, RunError, SchemaError, StepError};
pub use executor::{RunOptions, RunOutcome, StepRecord};
pub use graph::{GraphBuilder, StepGraph};
pub use record::{PartialUpdate, Record};
pub use schema::{FieldKind, FieldSpec, MergePolicy, Schema};
pub use step::{DynamicRouter, RouteTag, StepContext, StepKind, Target, END, START};

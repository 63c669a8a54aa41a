use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use stepgraph_core::config::EngineConfig;
use stepgraph_core::traits::TextGenerator;

use crate::error::{RunError, StepError};
use crate::graph::StepGraph;
use crate::record::{PartialUpdate, Record};
use crate::step::{StepBody, StepContext, StepKind, Target, END, START};

/// Per-run limits and scheduling.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Abort the run once this much wall time has passed.
    pub deadline: Option<Duration>,
    /// Abort the run when this token is cancelled.
    pub cancel: CancellationToken,
    /// Abort the run after this many step executions.
    pub step_limit: Option<usize>,
    /// Run the transforms of one wave concurrently.
    pub parallel: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
            step_limit: None,
            parallel: true,
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = Some(limit);
        self
    }

    /// Run transforms one at a time, in ready-queue order.
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }
}

impl From<&EngineConfig> for RunOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            deadline: config.deadline(),
            step_limit: config.step_limit,
            parallel: config.parallel,
            ..Self::default()
        }
    }
}

/// One step execution within a run.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: String,
    pub kind: StepKind,
    /// How many times this step had run, including this one.
    pub activation: u32,
    pub elapsed_ms: u64,
}

/// Result of a run that reached the end marker.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub record: Record,
    /// Step executions in merge order.
    pub trace: Vec<StepRecord>,
    pub total_elapsed_ms: u64,
}

impl RunOutcome {
    /// Number of times `step` executed.
    pub fn executions(&self, step: &str) -> usize {
        self.trace.iter().filter(|r| r.step == step).count()
    }

    /// Executed step names in merge order.
    pub fn path(&self) -> Vec<&str> {
        self.trace.iter().map(|r| r.step.as_str()).collect()
    }
}

struct RunState {
    run_id: Uuid,
    record: Record,
    trace: Vec<StepRecord>,
    activations: HashMap<String, u32>,
    /// Arrivals counted toward each join's current activation.
    arrivals: HashMap<String, usize>,
    ready: Vec<String>,
    reached_end: bool,
}

impl RunState {
    fn new(record: Record) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            record,
            trace: Vec::new(),
            activations: HashMap::new(),
            arrivals: HashMap::new(),
            ready: Vec::new(),
            reached_end: false,
        }
    }

    /// A step scheduled twice for the same wave runs once.
    fn enqueue(&mut self, step: &str) {
        if !self.ready.iter().any(|s| s == step) {
            self.ready.push(step.to_string());
        }
    }

    fn next_activation(&mut self, step: &str) -> u32 {
        let n = self.activations.entry(step.to_string()).or_insert(0);
        *n += 1;
        *n
    }
}

enum Effect {
    Update(PartialUpdate),
    Route { target: Target, defaulted: bool },
}

enum Interrupt {
    Finished(Result<(), RunError>),
    TimedOut(Duration),
    Cancelled,
}

impl StepGraph {
    /// Execute the graph once against `initial`.
    ///
    /// `initial` must be a JSON object holding every required field and no
    /// undeclared one. The generator is handed to every transform.
    pub async fn run(
        &self,
        initial: Value,
        generator: Arc<dyn TextGenerator>,
        options: RunOptions,
    ) -> Result<RunOutcome, RunError> {
        let start = Instant::now();
        let record = self
            .inner
            .schema
            .initial_record(initial)
            .map_err(RunError::InvalidInput)?;
        let mut state = RunState::new(record);
        let run_id = state.run_id;

        info!(run_id = %run_id, steps = self.inner.steps.len(), parallel = options.parallel, "Run started");

        let interrupt = {
            let deadline = async {
                match options.deadline {
                    Some(d) => {
                        tokio::time::sleep(d).await;
                        d
                    }
                    None => futures::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = options.cancel.cancelled() => Interrupt::Cancelled,
                after = deadline => Interrupt::TimedOut(after),
                result = self.drive(&mut state, &generator, &options) => Interrupt::Finished(result),
            }
        };

        let total_elapsed_ms = start.elapsed().as_millis() as u64;
        match interrupt {
            Interrupt::Finished(Ok(())) => {
                info!(
                    run_id = %run_id,
                    executed = state.trace.len(),
                    total_elapsed_ms,
                    "Run completed"
                );
                Ok(RunOutcome {
                    run_id,
                    record: state.record,
                    trace: state.trace,
                    total_elapsed_ms,
                })
            }
            Interrupt::Finished(Err(e)) => {
                error!(run_id = %run_id, error = %e, total_elapsed_ms, "Run failed");
                Err(e)
            }
            Interrupt::TimedOut(after) => {
                warn!(run_id = %run_id, ?after, "Run deadline expired");
                Err(RunError::TimedOut {
                    after,
                    record: state.record,
                })
            }
            Interrupt::Cancelled => {
                warn!(run_id = %run_id, "Run cancelled");
                Err(RunError::Cancelled {
                    record: state.record,
                })
            }
        }
    }

    async fn drive(
        &self,
        state: &mut RunState,
        generator: &Arc<dyn TextGenerator>,
        options: &RunOptions,
    ) -> Result<(), RunError> {
        for next in self.successors(START) {
            self.fire_edge(state, START, next);
        }

        let mut executed = 0usize;
        while !state.ready.is_empty() {
            let wave = std::mem::take(&mut state.ready);
            if let Some(limit) = options.step_limit {
                if executed + wave.len() > limit {
                    return Err(RunError::StepLimitExceeded {
                        limit,
                        record: state.record.clone(),
                    });
                }
            }
            executed += wave.len();

            debug!(run_id = %state.run_id, wave = ?wave, "Dispatching wave");

            let snapshot = Arc::new(state.record.clone());
            let activations: Vec<u32> = wave.iter().map(|s| state.next_activation(s)).collect();
            let run_id = state.run_id;

            let calls = wave.iter().zip(&activations).map(|(name, &activation)| {
                let body = &self.inner.steps[name.as_str()];
                let ctx = StepContext {
                    step: name.clone(),
                    run_id,
                    activation,
                    record: Arc::clone(&snapshot),
                    generator: Arc::clone(generator),
                };
                async move {
                    let started = Instant::now();
                    let effect = match body {
                        StepBody::Transform(transform) => transform(ctx).await.map(Effect::Update),
                        StepBody::Router(router) => router
                            .resolve(ctx.record())
                            .map(|(target, defaulted)| Effect::Route { target, defaulted }),
                    };
                    (effect, started.elapsed().as_millis() as u64)
                }
            });

            let results = if options.parallel {
                join_all(calls).await
            } else {
                let mut results = Vec::with_capacity(wave.len());
                for call in calls {
                    let result = call.await;
                    let failed = result.0.is_err();
                    results.push(result);
                    if failed {
                        break;
                    }
                }
                results
            };

            // Merge in ready-queue order; the first failure wins
            for ((name, activation), (effect, elapsed_ms)) in
                wave.iter().zip(activations).zip(results)
            {
                let fail = |source: StepError| {
                    error!(run_id = %run_id, step = %name, activation, error = %source, "Step failed");
                    RunError::StepFailed {
                        step: name.clone(),
                        record: (*snapshot).clone(),
                        source,
                    }
                };

                let kind = self.inner.steps[name.as_str()].kind();
                match effect.map_err(fail)? {
                    Effect::Update(update) => {
                        self.inner
                            .schema
                            .apply(&mut state.record, update)
                            .map_err(|e| fail(StepError::InvalidUpdate(e)))?;

                        let successors = self.successors(name);
                        if successors.is_empty() {
                            state.reached_end = true;
                        }
                        for next in successors {
                            self.fire_edge(state, name, next);
                        }
                    }
                    Effect::Route { target, defaulted } => {
                        if defaulted {
                            warn!(run_id = %run_id, router = %name, target = %target.node_name(), "Router value unmatched, taking default route");
                        }
                        match target {
                            Target::End => state.reached_end = true,
                            Target::Step(next) => state.enqueue(&next),
                        }
                    }
                }

                debug!(run_id = %run_id, step = %name, activation, elapsed_ms, "Step complete");
                state.trace.push(StepRecord {
                    step: name.clone(),
                    kind,
                    activation,
                    elapsed_ms,
                });
            }
        }

        if state.reached_end {
            Ok(())
        } else {
            let mut pending: Vec<String> = state
                .arrivals
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(s, _)| s.clone())
                .collect();
            pending.sort();
            Err(RunError::Stalled {
                pending,
                record: state.record.clone(),
            })
        }
    }

    /// Deliver one unconditional edge.
    fn fire_edge(&self, state: &mut RunState, from: &str, to: &str) {
        if to == END {
            state.reached_end = true;
            return;
        }
        if self.is_back_edge(from, to) {
            state.enqueue(to);
            return;
        }

        let arity = self.join_arity(to);
        let arrived = state.arrivals.entry(to.to_string()).or_insert(0);
        *arrived += 1;
        if *arrived >= arity {
            state.arrivals.remove(to);
            state.enqueue(to);
        }
    }
}

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::info;

use crate::error::{BuildError, StepError};
use crate::record::{PartialUpdate, Record};
use crate::schema::Schema;
use crate::step::{DynamicRouter, RouteTag, Router, StepBody, StepContext, Target, END, START};

/// Collects steps and edges, then validates them into a [`StepGraph`].
///
/// Declaration order matters: a fan-out schedules its successors in the
/// order their edges were added, and that order is the merge order.
pub struct GraphBuilder {
    schema: Schema,
    steps: IndexMap<String, StepBody>,
    duplicate_steps: Vec<String>,
    edges: Vec<(String, String)>,
    joins: Vec<(Vec<String>, String)>,
}

impl GraphBuilder {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            steps: IndexMap::new(),
            duplicate_steps: Vec::new(),
            edges: Vec::new(),
            joins: Vec::new(),
        }
    }

    fn add_step(&mut self, name: String, body: StepBody) {
        if self.steps.contains_key(&name) {
            self.duplicate_steps.push(name.clone());
        }
        self.steps.insert(name, body);
    }

    /// Add a step that reads the record and returns a partial update.
    pub fn add_transform<F, Fut>(&mut self, name: impl Into<String>, body: F) -> &mut Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PartialUpdate, StepError>> + Send + 'static,
    {
        self.add_step(name.into(), StepBody::transform(body));
        self
    }

    /// Add a router over a closed tag set.
    ///
    /// `route` is called once per tag in `T::ALL` to build the route table.
    pub fn add_router<T, D, M>(&mut self, name: impl Into<String>, decide: D, route: M) -> &mut Self
    where
        T: RouteTag,
        D: Fn(&Record) -> T + Send + Sync + 'static,
        M: Fn(T) -> Target,
    {
        self.add_step(name.into(), StepBody::Router(Router::typed(decide, route)));
        self
    }

    /// Add a router whose tags are strings declared up front.
    pub fn add_dynamic_router(&mut self, name: impl Into<String>, router: DynamicRouter) -> &mut Self {
        self.add_step(name.into(), StepBody::Router(router.into()));
        self
    }

    /// Add an unconditional edge. Use [`START`] and [`END`] for the markers.
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Add an edge from every predecessor to `target` and declare that
    /// `target` waits for all of them.
    pub fn add_join<I, S>(&mut self, predecessors: I, target: impl Into<String>) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let target = target.into();
        let preds: Vec<String> = predecessors.into_iter().map(Into::into).collect();
        for p in &preds {
            self.edges.push((p.clone(), target.clone()));
        }
        self.joins.push((preds, target));
        self
    }

    /// Validate the declaration and freeze it.
    pub fn build(self) -> Result<StepGraph, BuildError> {
        self.schema.check()?;

        if let Some(name) = self.duplicate_steps.first() {
            return Err(BuildError::DuplicateStep(name.clone()));
        }
        if let Some(name) = self.steps.keys().find(|n| *n == START || *n == END) {
            return Err(BuildError::ReservedName(name.clone()));
        }

        let is_node = |name: &str| name == START || name == END || self.steps.contains_key(name);

        // Edges
        let mut seen = HashSet::new();
        let mut successors: HashMap<String, Vec<String>> = HashMap::new();
        for (from, to) in &self.edges {
            for endpoint in [from, to] {
                if !is_node(endpoint) {
                    return Err(BuildError::UnknownStep {
                        from: from.clone(),
                        to: to.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
            if from == END {
                return Err(BuildError::EdgeFromEnd(to.clone()));
            }
            if to == START {
                return Err(BuildError::EdgeToStart(from.clone()));
            }
            if matches!(self.steps.get(from), Some(StepBody::Router(_))) {
                return Err(BuildError::RouterWithEdge(from.clone()));
            }
            if !seen.insert((from.as_str(), to.as_str())) {
                return Err(BuildError::DuplicateEdge {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
            successors.entry(from.clone()).or_default().push(to.clone());
        }
        if !successors.contains_key(START) {
            return Err(BuildError::NoEntry);
        }

        // Route tables
        for (name, body) in &self.steps {
            let StepBody::Router(router) = body else {
                continue;
            };
            check_router(name, router, &is_node)?;
        }

        // Reachability over edges and routes
        let next = |node: &str| -> Vec<String> {
            let mut out: Vec<String> = successors.get(node).cloned().unwrap_or_default();
            if let Some(StepBody::Router(router)) = self.steps.get(node) {
                out.extend(router.targets().map(|t| t.node_name().to_string()));
            }
            out
        };
        let reached = reachable_from(START, &next);
        if let Some(name) = self.steps.keys().find(|n| !reached.contains(n.as_str())) {
            return Err(BuildError::Unreachable(name.clone()));
        }
        let implicit_end = self.steps.iter().any(|(name, body)| {
            matches!(body, StepBody::Transform(_)) && !successors.contains_key(name)
        });
        if !reached.contains(END) && !implicit_end {
            return Err(BuildError::EndUnreachable);
        }

        // Back edges and join arity
        let back_edges = find_back_edges(&successors, &next);
        let mut forward_preds: HashMap<String, Vec<String>> = HashMap::new();
        for (from, to) in &self.edges {
            if to == END || back_edges.contains(&(from.clone(), to.clone())) {
                continue;
            }
            forward_preds.entry(to.clone()).or_default().push(from.clone());
        }

        for (declared, step) in &self.joins {
            let mut declared = declared.clone();
            declared.sort();
            let mut inferred = forward_preds.get(step).cloned().unwrap_or_default();
            inferred.sort();
            if declared != inferred {
                return Err(BuildError::JoinMismatch {
                    step: step.clone(),
                    declared,
                    inferred,
                });
            }
        }

        let join_arity = forward_preds
            .iter()
            .map(|(step, preds)| (step.clone(), preds.len()))
            .collect();

        info!(
            steps = self.steps.len(),
            edges = self.edges.len(),
            back_edges = back_edges.len(),
            "Step graph built"
        );

        Ok(StepGraph {
            inner: Arc::new(GraphInner {
                schema: self.schema,
                steps: self.steps,
                successors,
                back_edges,
                join_arity,
            }),
        })
    }
}

fn check_router(
    name: &str,
    router: &Router,
    is_node: &impl Fn(&str) -> bool,
) -> Result<(), BuildError> {
    if router.tags.is_empty() {
        return Err(BuildError::EmptyRouter(name.to_string()));
    }
    let mut tags = HashSet::new();
    for tag in &router.tags {
        if !tags.insert(tag.as_str()) {
            return Err(BuildError::DuplicateRouteTag {
                router: name.to_string(),
                tag: tag.clone(),
            });
        }
    }
    if let Some(tag) = router.routes.keys().find(|t| !tags.contains(t.as_str())) {
        return Err(BuildError::UnknownRouteTag {
            router: name.to_string(),
            tag: tag.clone(),
        });
    }
    if router.default.is_none() {
        if let Some(tag) = router.tags.iter().find(|t| !router.routes.contains_key(*t)) {
            return Err(BuildError::UncoveredTag {
                router: name.to_string(),
                tag: tag.clone(),
            });
        }
    }
    for target in router.targets() {
        let node = target.node_name();
        if node == START || !is_node(node) {
            return Err(BuildError::UnknownRouteTarget {
                router: name.to_string(),
                target: node.to_string(),
            });
        }
    }
    Ok(())
}

fn reachable_from(origin: &str, next: &impl Fn(&str) -> Vec<String>) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<String> = next(origin).into();
    while let Some(node) = queue.pop_front() {
        if seen.insert(node.clone()) {
            queue.extend(next(&node));
        }
    }
    seen
}

/// Unconditional edges whose target is still on the depth-first path from
/// [`START`] when the edge is explored.
///
/// Routes are followed so loops closed through a router are walked, but only
/// edges are ever classified. Children are visited in declaration order.
fn find_back_edges(
    successors: &HashMap<String, Vec<String>>,
    next: &impl Fn(&str) -> Vec<String>,
) -> HashSet<(String, String)> {
    let mut back_edges = HashSet::new();
    let mut visited: HashSet<String> = HashSet::from([START.to_string()]);
    let mut on_path: HashSet<String> = HashSet::from([START.to_string()]);
    // (node, nodes it leads to, index of the next one to explore)
    let mut stack: Vec<(String, Vec<String>, usize)> = vec![(START.to_string(), next(START), 0)];

    while let Some((node, out, i)) = stack.last_mut() {
        let Some(child) = out.get(*i).cloned() else {
            on_path.remove(node.as_str());
            stack.pop();
            continue;
        };
        *i += 1;

        let is_edge = successors
            .get(node.as_str())
            .is_some_and(|s| s.contains(&child));
        if on_path.contains(&child) {
            if is_edge {
                back_edges.insert((node.clone(), child));
            }
        } else if visited.insert(child.clone()) {
            on_path.insert(child.clone());
            let out = next(&child);
            stack.push((child, out, 0));
        }
    }
    back_edges
}

pub(crate) struct GraphInner {
    pub(crate) schema: Schema,
    pub(crate) steps: IndexMap<String, StepBody>,
    /// Unconditional successors per node, in declaration order.
    pub(crate) successors: HashMap<String, Vec<String>>,
    pub(crate) back_edges: HashSet<(String, String)>,
    pub(crate) join_arity: HashMap<String, usize>,
}

/// A validated, immutable step graph.
///
/// Cloning is cheap. A graph may run any number of times, concurrently,
/// with different initial records and generators.
#[derive(Clone)]
pub struct StepGraph {
    pub(crate) inner: Arc<GraphInner>,
}

impl StepGraph {
    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Step names in declaration order.
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.inner.steps.keys().map(|k| k.as_str())
    }

    /// Number of forward unconditional predecessors `step` waits for.
    ///
    /// Zero for steps only entered through routes or back edges.
    pub fn join_arity(&self, step: &str) -> usize {
        self.inner.join_arity.get(step).copied().unwrap_or(0)
    }

    /// Unconditional successors of a step (or of [`START`]).
    pub fn successors(&self, node: &str) -> &[String] {
        self.inner
            .successors
            .get(node)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Whether the edge `from -> to` returns to a step on its own path from
    /// [`START`]. Such an edge re-activates its target directly.
    pub fn is_back_edge(&self, from: &str, to: &str) -> bool {
        self.inner
            .back_edges
            .contains(&(from.to_string(), to.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldKind;

    fn schema() -> Schema {
        Schema::new().optional("n", FieldKind::Integer)
    }

    async fn noop(_ctx: StepContext) -> Result<PartialUpdate, StepError> {
        Ok(PartialUpdate::new())
    }

    #[derive(Debug, Clone, Copy)]
    enum Loop {
        Again,
        Done,
    }

    impl RouteTag for Loop {
        const ALL: &'static [Self] = &[Loop::Again, Loop::Done];

        fn as_str(&self) -> &'static str {
            match self {
                Loop::Again => "again",
                Loop::Done => "done",
            }
        }
    }

    #[test]
    fn test_linear_graph_builds() {
        let mut g = GraphBuilder::new(schema());
        g.add_transform("a", noop)
            .add_transform("b", noop)
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("b", END);
        let graph = g.build().unwrap();

        assert_eq!(graph.step_names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(graph.join_arity("b"), 1);
        assert_eq!(graph.successors(START), ["a".to_string()]);
    }

    #[test]
    fn test_join_arity_inferred_and_declared() {
        let mut g = GraphBuilder::new(schema());
        g.add_transform("x", noop)
            .add_transform("y", noop)
            .add_transform("z", noop)
            .add_transform("combine", noop)
            .add_edge(START, "x")
            .add_edge(START, "y")
            .add_edge(START, "z")
            .add_join(["x", "y", "z"], "combine")
            .add_edge("combine", END);
        let graph = g.build().unwrap();
        assert_eq!(graph.join_arity("combine"), 3);
        assert_eq!(graph.join_arity("x"), 1);
    }

    #[test]
    fn test_join_declaration_mismatch() {
        let mut g = GraphBuilder::new(schema());
        g.add_transform("x", noop)
            .add_transform("y", noop)
            .add_transform("combine", noop)
            .add_edge(START, "x")
            .add_edge(START, "y")
            .add_edge("y", "combine")
            .add_join(["x"], "combine");
        let err = g.build().err().unwrap();
        assert!(matches!(err, BuildError::JoinMismatch { ref step, .. } if step == "combine"));
    }

    #[test]
    fn test_back_edge_excluded_from_arity() {
        let mut g = GraphBuilder::new(schema());
        g.add_transform("generate", noop)
            .add_transform("evaluate", noop)
            .add_transform("optimize", noop)
            .add_router(
                "route",
                |_: &Record| Loop::Done,
                |tag| match tag {
                    Loop::Again => Target::step("optimize"),
                    Loop::Done => Target::End,
                },
            )
            .add_edge(START, "generate")
            .add_edge("generate", "evaluate")
            .add_edge("evaluate", "route")
            .add_edge("optimize", "evaluate");
        let graph = g.build().unwrap();

        assert_eq!(graph.join_arity("evaluate"), 1);
        assert!(graph.is_back_edge("optimize", "evaluate"));
        assert!(!graph.is_back_edge("generate", "evaluate"));
    }

    #[test]
    fn test_join_inside_loop_keeps_its_arity() {
        let mut g = GraphBuilder::new(schema());
        g.add_transform("head", noop)
            .add_transform("x", noop)
            .add_transform("y1", noop)
            .add_transform("y2", noop)
            .add_transform("j", noop)
            .add_router(
                "r",
                |_: &Record| Loop::Done,
                |tag| match tag {
                    Loop::Again => Target::step("head"),
                    Loop::Done => Target::End,
                },
            )
            .add_edge(START, "head")
            .add_edge("head", "x")
            .add_edge("head", "y1")
            .add_edge("y1", "y2")
            .add_join(["x", "y2"], "j")
            .add_edge("j", "r");
        let graph = g.build().unwrap();

        assert_eq!(graph.join_arity("j"), 2);
        assert!(!graph.is_back_edge("x", "j"));
        assert!(!graph.is_back_edge("y2", "j"));
    }

    #[test]
    fn test_edge_loop_back_edge_is_the_closing_one() {
        let mut g = GraphBuilder::new(schema());
        g.add_transform("a", noop)
            .add_transform("b", noop)
            .add_transform("c", noop)
            .add_router(
                "r",
                |_: &Record| Loop::Done,
                |tag| match tag {
                    Loop::Again => Target::step("a"),
                    Loop::Done => Target::End,
                },
            )
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("b", "c")
            .add_edge("c", "a")
            .add_edge("b", "r");
        let graph = g.build().unwrap();

        assert!(graph.is_back_edge("c", "a"));
        assert!(!graph.is_back_edge("a", "b"));
        assert!(!graph.is_back_edge("b", "c"));
        assert_eq!(graph.join_arity("a"), 1);
        assert_eq!(graph.join_arity("b"), 1);
    }

    #[test]
    fn test_unknown_endpoint() {
        let mut g = GraphBuilder::new(schema());
        g.add_transform("a", noop)
            .add_edge(START, "a")
            .add_edge("a", "ghost");
        let err = g.build().err().unwrap();
        assert_eq!(
            err,
            BuildError::UnknownStep {
                from: "a".into(),
                to: "ghost".into(),
                missing: "ghost".into()
            }
        );
    }

    #[test]
    fn test_duplicate_and_reserved_names() {
        let mut g = GraphBuilder::new(schema());
        g.add_transform("a", noop).add_transform("a", noop).add_edge(START, "a");
        assert_eq!(g.build().err().unwrap(), BuildError::DuplicateStep("a".into()));

        let mut g = GraphBuilder::new(schema());
        g.add_transform(END, noop).add_edge(START, END);
        assert_eq!(g.build().err().unwrap(), BuildError::ReservedName(END.into()));
    }

    #[test]
    fn test_marker_edge_direction() {
        let mut g = GraphBuilder::new(schema());
        g.add_transform("a", noop)
            .add_edge(START, "a")
            .add_edge("a", START);
        assert_eq!(g.build().err().unwrap(), BuildError::EdgeToStart("a".into()));

        let mut g = GraphBuilder::new(schema());
        g.add_transform("a", noop)
            .add_edge(START, "a")
            .add_edge(END, "a");
        assert_eq!(g.build().err().unwrap(), BuildError::EdgeFromEnd("a".into()));
    }

    #[test]
    fn test_duplicate_edge_and_missing_entry() {
        let mut g = GraphBuilder::new(schema());
        g.add_transform("a", noop)
            .add_edge(START, "a")
            .add_edge(START, "a");
        assert!(matches!(g.build().err().unwrap(), BuildError::DuplicateEdge { .. }));

        let mut g = GraphBuilder::new(schema());
        g.add_transform("a", noop);
        assert_eq!(g.build().err().unwrap(), BuildError::NoEntry);
    }

    #[test]
    fn test_unreachable_step() {
        let mut g = GraphBuilder::new(schema());
        g.add_transform("a", noop)
            .add_transform("island", noop)
            .add_edge(START, "a");
        assert_eq!(g.build().err().unwrap(), BuildError::Unreachable("island".into()));
    }

    #[test]
    fn test_end_unreachable_in_closed_loop() {
        let mut g = GraphBuilder::new(schema());
        g.add_transform("a", noop)
            .add_transform("b", noop)
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("b", "a");
        assert_eq!(g.build().err().unwrap(), BuildError::EndUnreachable);
    }

    #[test]
    fn test_router_rules() {
        let mut g = GraphBuilder::new(schema());
        g.add_transform("a", noop)
            .add_dynamic_router(
                "r",
                DynamicRouter::new(|_| "yes".into())
                    .tags(["yes", "no"])
                    .route("yes", Target::End),
            )
            .add_edge(START, "a")
            .add_edge("a", "r");
        assert_eq!(
            g.build().err().unwrap(),
            BuildError::UncoveredTag {
                router: "r".into(),
                tag: "no".into()
            }
        );

        let mut g = GraphBuilder::new(schema());
        g.add_dynamic_router(
            "r",
            DynamicRouter::new(|_| "yes".into())
                .tags(["yes"])
                .route("yes", Target::step("nowhere")),
        )
        .add_edge(START, "r");
        assert!(matches!(
            g.build().err().unwrap(),
            BuildError::UnknownRouteTarget { .. }
        ));

        let mut g = GraphBuilder::new(schema());
        g.add_transform("a", noop)
            .add_dynamic_router(
                "r",
                DynamicRouter::new(|_| "yes".into())
                    .tags(["yes"])
                    .route("yes", Target::End),
            )
            .add_edge(START, "r")
            .add_edge("r", "a");
        assert_eq!(g.build().err().unwrap(), BuildError::RouterWithEdge("r".into()));
    }

    #[test]
    fn test_default_route_covers_remaining_tags() {
        let mut g = GraphBuilder::new(schema());
        g.add_dynamic_router(
            "r",
            DynamicRouter::new(|_| "maybe".into())
                .tags(["yes", "no", "maybe"])
                .route("yes", Target::End)
                .default_route(Target::End),
        )
        .add_edge(START, "r");
        assert!(g.build().is_ok());
    }

    #[test]
    fn test_schema_checked_at_build() {
        let bad = Schema::new()
            .optional("a", FieldKind::String)
            .optional("a", FieldKind::String);
        let mut g = GraphBuilder::new(bad);
        g.add_transform("a", noop).add_edge(START, "a");
        assert!(matches!(g.build().err().unwrap(), BuildError::Schema(_)));
    }
}

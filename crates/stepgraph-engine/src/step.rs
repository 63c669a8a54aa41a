use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::Serialize;
use uuid::Uuid;

use stepgraph_core::traits::TextGenerator;

use crate::error::StepError;
use crate::record::{PartialUpdate, Record};

/// Marker for the entry of every graph.
pub const START: &str = "__start__";
/// Marker for the terminal of every graph.
pub const END: &str = "__end__";

/// What a transform hands back to the engine.
pub type StepFuture = BoxFuture<'static, Result<PartialUpdate, StepError>>;

pub(crate) type TransformFn = Arc<dyn Fn(StepContext) -> StepFuture + Send + Sync>;
pub(crate) type DecideFn = Arc<dyn Fn(&Record) -> String + Send + Sync>;

/// Everything a transform body may look at.
#[derive(Clone)]
pub struct StepContext {
    pub(crate) step: String,
    pub(crate) run_id: Uuid,
    pub(crate) activation: u32,
    pub(crate) record: Arc<Record>,
    pub(crate) generator: Arc<dyn TextGenerator>,
}

impl StepContext {
    /// Name of the running step.
    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// 1 on the first execution of this step within the run, then 2, 3, ...
    pub fn activation(&self) -> u32 {
        self.activation
    }

    /// Read-only snapshot of the record taken when the step was dispatched.
    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn generator(&self) -> &Arc<dyn TextGenerator> {
        &self.generator
    }
}

/// Where a router sends the run next.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Step(String),
    End,
}

impl Target {
    pub fn step(name: impl Into<String>) -> Self {
        Self::Step(name.into())
    }

    pub(crate) fn node_name(&self) -> &str {
        match self {
            Self::Step(name) => name,
            Self::End => END,
        }
    }
}

/// A closed set of routing decisions.
///
/// `ALL` lists every variant so the graph builder can enumerate the route
/// table; the table itself comes from an exhaustive `match` in the caller.
pub trait RouteTag: Copy + Send + Sync + 'static {
    const ALL: &'static [Self];

    fn as_str(&self) -> &'static str;
}

/// A router whose tags are only known at runtime.
///
/// Declared tags are checked against the route table at build time; a
/// value outside the table falls back to the default, or fails the step.
pub struct DynamicRouter {
    pub(crate) decide: DecideFn,
    pub(crate) tags: Vec<String>,
    pub(crate) routes: IndexMap<String, Target>,
    pub(crate) default: Option<Target>,
}

impl DynamicRouter {
    pub fn new<F>(decide: F) -> Self
    where
        F: Fn(&Record) -> String + Send + Sync + 'static,
    {
        Self {
            decide: Arc::new(decide),
            tags: Vec::new(),
            routes: IndexMap::new(),
            default: None,
        }
    }

    /// Declare the values `decide` may return.
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn route(mut self, tag: impl Into<String>, target: Target) -> Self {
        self.routes.insert(tag.into(), target);
        self
    }

    pub fn default_route(mut self, target: Target) -> Self {
        self.default = Some(target);
        self
    }
}

/// A resolved router: decision function plus its route table.
pub(crate) struct Router {
    pub(crate) decide: DecideFn,
    pub(crate) tags: Vec<String>,
    pub(crate) routes: IndexMap<String, Target>,
    pub(crate) default: Option<Target>,
}

impl Router {
    pub(crate) fn typed<T, D, M>(decide: D, route: M) -> Self
    where
        T: RouteTag,
        D: Fn(&Record) -> T + Send + Sync + 'static,
        M: Fn(T) -> Target,
    {
        let tags: Vec<String> = T::ALL.iter().map(|t| t.as_str().to_string()).collect();
        let routes = T::ALL
            .iter()
            .map(|t| (t.as_str().to_string(), route(*t)))
            .collect();
        Self {
            decide: Arc::new(move |record| decide(record).as_str().to_string()),
            tags,
            routes,
            default: None,
        }
    }

    pub(crate) fn targets(&self) -> impl Iterator<Item = &Target> {
        self.routes.values().chain(self.default.iter())
    }

    /// Pick the next target for `record`. The flag is true when the default was used.
    pub(crate) fn resolve(&self, record: &Record) -> Result<(Target, bool), StepError> {
        let value = (self.decide)(record);
        if let Some(target) = self.routes.get(&value) {
            return Ok((target.clone(), false));
        }
        match &self.default {
            Some(target) => Ok((target.clone(), true)),
            None => Err(StepError::RouterMismatch { value }),
        }
    }
}

impl From<DynamicRouter> for Router {
    fn from(r: DynamicRouter) -> Self {
        Self {
            decide: r.decide,
            tags: r.tags,
            routes: r.routes,
            default: r.default,
        }
    }
}

/// The two shapes a step body can take.
pub(crate) enum StepBody {
    Transform(TransformFn),
    Router(Router),
}

impl StepBody {
    pub(crate) fn transform<F, Fut>(body: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PartialUpdate, StepError>> + Send + 'static,
    {
        Self::Transform(Arc::new(move |ctx| Box::pin(body(ctx))))
    }

    pub(crate) fn kind(&self) -> StepKind {
        match self {
            Self::Transform(_) => StepKind::Transform,
            Self::Router(_) => StepKind::Router,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Transform,
    Router,
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Mood {
        Happy,
        Sad,
    }

    impl RouteTag for Mood {
        const ALL: &'static [Self] = &[Mood::Happy, Mood::Sad];

        fn as_str(&self) -> &'static str {
            match self {
                Mood::Happy => "happy",
                Mood::Sad => "sad",
            }
        }
    }

    fn record_with(mood: &str) -> Record {
        let mut fields = IndexMap::new();
        fields.insert("mood".to_string(), json!(mood));
        Record::from_fields(fields)
    }

    #[test]
    fn test_typed_router_enumerates_every_tag() {
        let router = Router::typed(
            |r: &Record| {
                if r.get_str("mood") == Some("happy") {
                    Mood::Happy
                } else {
                    Mood::Sad
                }
            },
            |tag| match tag {
                Mood::Happy => Target::step("celebrate"),
                Mood::Sad => Target::End,
            },
        );
        assert_eq!(router.tags, vec!["happy", "sad"]);
        assert_eq!(router.routes.len(), 2);

        let (target, defaulted) = router.resolve(&record_with("happy")).unwrap();
        assert_eq!(target, Target::step("celebrate"));
        assert!(!defaulted);
        assert_eq!(router.resolve(&record_with("meh")).unwrap().0, Target::End);
    }

    #[test]
    fn test_dynamic_router_default_and_mismatch() {
        let decide = |r: &Record| r.get_str("mood").unwrap_or_default().to_string();

        let strict: Router = DynamicRouter::new(decide)
            .tags(["happy"])
            .route("happy", Target::End)
            .into();
        let err = strict.resolve(&record_with("angry")).unwrap_err();
        assert!(matches!(err, StepError::RouterMismatch { ref value } if value == "angry"));

        let lenient: Router = DynamicRouter::new(decide)
            .tags(["happy"])
            .route("happy", Target::End)
            .default_route(Target::step("escalate"))
            .into();
        let (target, defaulted) = lenient.resolve(&record_with("angry")).unwrap();
        assert_eq!(target, Target::step("escalate"));
        assert!(defaulted);
    }

    #[test]
    fn test_target_node_names() {
        assert_eq!(Target::End.node_name(), END);
        assert_eq!(Target::step("x").node_name(), "x");
    }
}

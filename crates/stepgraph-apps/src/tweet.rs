//! Tweet writer with a critic in the loop.
//!
//! `generate` drafts a tweet, `evaluate` judges it, and the router either
//! accepts the draft or sends it to `optimize`, whose rewrite is judged
//! again. The loop ends on approval or once `iterations` reaches
//! `max_iterations`, so the last draft is returned even if the critic never
//! approved it.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use stepgraph_core::traits::TextGenerator;
use stepgraph_core::{ChatMessage, OutputSchema};
use stepgraph_engine::{
    BuildError, FieldKind, FieldSpec, GraphBuilder, PartialUpdate, Record, RouteTag, RunOptions,
    Schema, StepContext, StepError, StepGraph, Target, END, START,
};

use crate::{str_field, AppError, AppRun};

const NEEDS_IMPROVEMENT: &str = "needs_improvement";

pub fn schema() -> Schema {
    Schema::new()
        .required("topic", FieldKind::String)
        .optional("tweet", FieldKind::String)
        .field(
            "evaluation",
            FieldSpec::new(FieldKind::String).with_default(NEEDS_IMPROVEMENT),
        )
        .optional("feedback", FieldKind::String)
        .optional("iterations", FieldKind::Integer)
        .required("max_iterations", FieldKind::Integer)
        .appending("tweet_history")
}

fn evaluation_schema() -> OutputSchema {
    OutputSchema::new("tweet_evaluation")
        .one_of("evaluation", &["approved", NEEDS_IMPROVEMENT])
        .text("feedback")
        .describe("one paragraph explaining the verdict")
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Verdict {
    Approved,
    NeedsImprovement,
}

impl RouteTag for Verdict {
    const ALL: &'static [Self] = &[Verdict::Approved, Verdict::NeedsImprovement];

    fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approved => "approved",
            Verdict::NeedsImprovement => NEEDS_IMPROVEMENT,
        }
    }
}

fn iterations(record: &Record) -> i64 {
    record.get_i64("iterations").unwrap_or(0)
}

fn drafted(tweet: String, iterations: i64) -> PartialUpdate {
    PartialUpdate::new()
        .set("tweet_history", json!([tweet.clone()]))
        .set("tweet", tweet)
        .set("iterations", iterations + 1)
}

async fn generate(ctx: StepContext) -> Result<PartialUpdate, StepError> {
    let record = ctx.record();
    let prompt = format!(
        "Write a short, original, and hilarious tweet about: \"{}\".\n\n\
         Rules:\n\
         - No Q&A format.\n\
         - Under 280 characters.\n\
         - Use sarcasm, irony, meme-logic, or observational humor.\n\
         - Simple English.\n\
         - Version {}.",
        record.get_str("topic").unwrap_or_default(),
        iterations(record) + 1
    );
    let messages = vec![
        ChatMessage::system("You are a funny and clever Twitter/X influencer."),
        ChatMessage::user(prompt),
    ];
    let tweet = ctx.generator().generate(messages).await?;
    Ok(drafted(tweet, iterations(ctx.record())))
}

async fn evaluate(ctx: StepContext) -> Result<PartialUpdate, StepError> {
    let prompt = format!(
        "Evaluate the following tweet:\n\n\"{}\"\n\n\
         Criteria:\n\
         1. Fresh originality\n\
         2. Humor impact\n\
         3. Punchiness\n\
         4. Virality potential\n\
         5. Proper tweet format (no Q&A, no setup-punchline, <280 chars)\n\n\
         Auto-reject if:\n\
         - It's Q&A format\n\
         - Too long\n\
         - Setup-punchline joke\n\
         - Ends with generic or flat lines",
        ctx.record().get_str("tweet").unwrap_or_default()
    );
    let messages = vec![
        ChatMessage::system("You are a ruthless Twitter critic. No mercy."),
        ChatMessage::user(prompt),
    ];
    let out = ctx
        .generator()
        .generate_structured(messages, &evaluation_schema())
        .await?;
    Ok(PartialUpdate::from(out))
}

async fn optimize(ctx: StepContext) -> Result<PartialUpdate, StepError> {
    let record = ctx.record();
    let prompt = format!(
        "Improve this tweet:\n\n\
         Original: \"{}\"\n\n\
         Feedback:\n\"{}\"\n\n\
         Rewrite it as a sharper, funnier, viral-worthy tweet.\n\
         Rules:\n\
         - Under 280 chars\n\
         - No Q&A\n\
         - No setup-punchline\n\
         - Keep same topic\n\
         - Output ONLY the improved tweet",
        record.get_str("tweet").unwrap_or_default(),
        record.get_str("feedback").unwrap_or_default()
    );
    let messages = vec![
        ChatMessage::system("You improve tweets for humor, punchiness, and virality."),
        ChatMessage::user(prompt),
    ];
    let tweet = ctx.generator().generate(messages).await?;
    Ok(drafted(tweet, iterations(ctx.record())))
}

fn route_evaluation(record: &Record) -> Verdict {
    let approved = record.get_str("evaluation") == Some("approved");
    let max = record.get_i64("max_iterations").unwrap_or(1);
    if approved || iterations(record) >= max {
        Verdict::Approved
    } else {
        Verdict::NeedsImprovement
    }
}

pub fn graph() -> Result<StepGraph, BuildError> {
    let mut g = GraphBuilder::new(schema());
    g.add_transform("generate", generate)
        .add_transform("evaluate", evaluate)
        .add_transform("optimize", optimize)
        .add_router("route_evaluation", route_evaluation, |v| match v {
            Verdict::Approved => Target::End,
            Verdict::NeedsImprovement => Target::step("optimize"),
        })
        .add_edge(START, "generate")
        .add_edge("generate", "evaluate")
        .add_edge("evaluate", "route_evaluation")
        .add_edge("optimize", "evaluate");
    g.build()
}

#[derive(Debug, Clone)]
pub struct TweetInput {
    pub topic: String,
    pub max_iterations: u32,
}

impl TweetInput {
    pub fn new(topic: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            topic: topic.into(),
            max_iterations,
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.topic.trim().is_empty() {
            return Err(AppError::InvalidInput("tweet topic is empty".into()));
        }
        if self.max_iterations < 1 {
            return Err(AppError::InvalidInput("max_iterations must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TweetOutput {
    pub tweet: String,
    pub evaluation: String,
    pub feedback: String,
    pub iterations: i64,
    pub history: Vec<String>,
}

impl TweetOutput {
    pub fn from_record(record: &Record) -> Self {
        let history = record
            .get_list("tweet_history")
            .map(|l| l.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        Self {
            tweet: str_field(record, "tweet"),
            evaluation: str_field(record, "evaluation"),
            feedback: str_field(record, "feedback"),
            iterations: iterations(record),
            history,
        }
    }

    pub fn approved(&self) -> bool {
        self.evaluation == "approved"
    }
}

impl fmt::Display for TweetOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}\n", self.tweet)?;
        let verdict = if self.approved() { "approved" } else { "not approved" };
        writeln!(f, "Verdict: {} after {} iteration(s)", verdict, self.iterations)?;
        if !self.feedback.is_empty() {
            writeln!(f, "Feedback: {}", self.feedback)?;
        }
        if self.history.len() > 1 {
            writeln!(f, "\nDrafts:")?;
            for (i, draft) in self.history.iter().enumerate() {
                writeln!(f, "  {}. {}", i + 1, draft)?;
            }
        }
        Ok(())
    }
}

pub async fn run(
    input: TweetInput,
    generator: Arc<dyn TextGenerator>,
    options: RunOptions,
) -> Result<AppRun<TweetOutput>, AppError> {
    input.validate()?;
    let outcome = graph()?
        .run(
            json!({"topic": input.topic, "max_iterations": input.max_iterations}),
            generator,
            options,
        )
        .await?;
    Ok(AppRun {
        output: TweetOutput::from_record(&outcome.record),
        outcome,
    })
}

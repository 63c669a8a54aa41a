//! Customer review responder.
//!
//! Classifies the sentiment of a review and branches: positive reviews get a
//! thank-you note, negative ones are diagnosed first and then answered with a
//! support reply tuned to the diagnosis.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use stepgraph_core::traits::TextGenerator;
use stepgraph_core::{ChatMessage, OutputSchema};
use stepgraph_engine::{
    BuildError, FieldKind, GraphBuilder, PartialUpdate, Record, RouteTag, RunOptions, Schema,
    StepContext, StepError, StepGraph, Target, END, START,
};

use crate::{str_field, AppError, AppRun};

pub fn schema() -> Schema {
    Schema::new()
        .required("review", FieldKind::String)
        .optional("sentiment", FieldKind::String)
        .optional("diagnosis", FieldKind::Map)
        .optional("response", FieldKind::String)
}

fn sentiment_schema() -> OutputSchema {
    OutputSchema::new("sentiment")
        .one_of("sentiment", &["positive", "negative"])
        .describe("sentiment of the review")
}

fn diagnosis_schema() -> OutputSchema {
    OutputSchema::new("diagnosis")
        .one_of("issue_type", &["product", "service", "pricing", "delivery"])
        .describe("category of issue mentioned in the review")
        .one_of("tone", &["positive", "neutral", "negative", "calm", "angry"])
        .describe("emotional tone expressed by the user")
        .one_of("urgency", &["low", "medium", "high"])
        .describe("how urgent or critical the issue appears")
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Sentiment {
    Positive,
    Negative,
}

impl RouteTag for Sentiment {
    const ALL: &'static [Self] = &[Sentiment::Positive, Sentiment::Negative];

    fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
        }
    }
}

fn review_text(ctx: &StepContext) -> &str {
    ctx.record().get_str("review").unwrap_or_default()
}

async fn find_sentiment(ctx: StepContext) -> Result<PartialUpdate, StepError> {
    let prompt = format!(
        "Determine if the sentiment of this review is positive or negative:\n\n\"{}\"",
        review_text(&ctx)
    );
    let out = ctx
        .generator()
        .generate_structured(vec![ChatMessage::user(prompt)], &sentiment_schema())
        .await?;
    let sentiment = out.get("sentiment").cloned().unwrap_or_default();
    Ok(PartialUpdate::new().set("sentiment", sentiment))
}

fn check_sentiment(record: &Record) -> Sentiment {
    match record.get_str("sentiment") {
        Some("positive") => Sentiment::Positive,
        _ => Sentiment::Negative,
    }
}

async fn positive_response(ctx: StepContext) -> Result<PartialUpdate, StepError> {
    let prompt = format!(
        "Write a warm and friendly thank-you message in response to this review:\n\n\
         \"{}\"\n\n\
         Also encourage the user to leave feedback on our website.",
        review_text(&ctx)
    );
    let reply = ctx.generator().generate(vec![ChatMessage::user(prompt)]).await?;
    Ok(PartialUpdate::new().set("response", reply))
}

async fn run_diagnosis(ctx: StepContext) -> Result<PartialUpdate, StepError> {
    let prompt = format!(
        "Diagnose this negative review:\n\n\"{}\"\n\nIdentify issue_type, tone, and urgency.",
        review_text(&ctx)
    );
    let out = ctx
        .generator()
        .generate_structured(vec![ChatMessage::user(prompt)], &diagnosis_schema())
        .await?;
    Ok(PartialUpdate::new().set("diagnosis", Value::Object(out)))
}

async fn negative_response(ctx: StepContext) -> Result<PartialUpdate, StepError> {
    let diagnosis = Diagnosis::from_value(ctx.record().get("diagnosis"))
        .ok_or_else(|| StepError::failed("diagnosis missing before negative response"))?;
    let prompt = format!(
        "You are a professional customer support assistant.\n\
         The user had a \"{}\" issue.\n\
         Tone: {}\n\
         Urgency: {}\n\n\
         Review:\n\"{}\"\n\n\
         Write an empathetic, helpful response with a clear resolution.",
        diagnosis.issue_type,
        diagnosis.tone,
        diagnosis.urgency,
        review_text(&ctx)
    );
    let reply = ctx.generator().generate(vec![ChatMessage::user(prompt)]).await?;
    Ok(PartialUpdate::new().set("response", reply))
}

pub fn graph() -> Result<StepGraph, BuildError> {
    let mut g = GraphBuilder::new(schema());
    g.add_transform("find_sentiment", find_sentiment)
        .add_router("check_sentiment", check_sentiment, |s| match s {
            Sentiment::Positive => Target::step("positive_response"),
            Sentiment::Negative => Target::step("run_diagnosis"),
        })
        .add_transform("positive_response", positive_response)
        .add_transform("run_diagnosis", run_diagnosis)
        .add_transform("negative_response", negative_response)
        .add_edge(START, "find_sentiment")
        .add_edge("find_sentiment", "check_sentiment")
        .add_edge("positive_response", END)
        .add_edge("run_diagnosis", "negative_response")
        .add_edge("negative_response", END);
    g.build()
}

#[derive(Debug, Clone)]
pub struct ReviewInput {
    pub review: String,
}

impl ReviewInput {
    pub fn new(review: impl Into<String>) -> Self {
        Self {
            review: review.into(),
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.review.trim().is_empty() {
            return Err(AppError::InvalidInput("review text is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnosis {
    pub issue_type: String,
    pub tone: String,
    pub urgency: String,
}

impl Diagnosis {
    fn from_value(value: Option<&Value>) -> Option<Self> {
        let obj = value?.as_object()?;
        let field = |k: &str| obj.get(k).and_then(Value::as_str).map(str::to_string);
        Some(Self {
            issue_type: field("issue_type")?,
            tone: field("tone")?,
            urgency: field("urgency")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutput {
    pub sentiment: String,
    pub diagnosis: Option<Diagnosis>,
    pub response: String,
}

impl ReviewOutput {
    pub fn from_record(record: &Record) -> Self {
        Self {
            sentiment: str_field(record, "sentiment"),
            diagnosis: Diagnosis::from_value(record.get("diagnosis")),
            response: str_field(record, "response"),
        }
    }
}

impl fmt::Display for ReviewOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sentiment: {}", self.sentiment)?;
        if let Some(d) = &self.diagnosis {
            writeln!(
                f,
                "Diagnosis: {} issue, {} tone, {} urgency",
                d.issue_type, d.tone, d.urgency
            )?;
        }
        write!(f, "\n{}", self.response)
    }
}

pub async fn run(
    input: ReviewInput,
    generator: Arc<dyn TextGenerator>,
    options: RunOptions,
) -> Result<AppRun<ReviewOutput>, AppError> {
    input.validate()?;
    let outcome = graph()?
        .run(json!({"review": input.review}), generator, options)
        .await?;
    Ok(AppRun {
        output: ReviewOutput::from_record(&outcome.record),
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepgraph_core::StepGraphError;
    use stepgraph_engine::RunError;
    use stepgraph_test_utils::ScriptedGenerator;

    fn negative_model() -> Arc<ScriptedGenerator> {
        Arc::new(
            ScriptedGenerator::new()
                .on_json("Determine if the sentiment", json!({"sentiment": "negative"}))
                .on_json(
                    "Diagnose this negative review",
                    json!({"issue_type": "delivery", "tone": "angry", "urgency": "high"}),
                )
                .on_text("customer support assistant", "We are sorry, a replacement ships today."),
        )
    }

    #[tokio::test]
    async fn test_positive_review_gets_thank_you() {
        let model = Arc::new(
            ScriptedGenerator::new()
                .on_json("Determine if the sentiment", json!({"sentiment": "Positive"}))
                .on_text("thank-you message", "Thank you so much!"),
        );
        let run = run(
            ReviewInput::new("Loved it, works great."),
            model.clone(),
            RunOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(run.output.sentiment, "positive");
        assert_eq!(run.output.response, "Thank you so much!");
        assert!(run.output.diagnosis.is_none());
        assert_eq!(run.outcome.executions("run_diagnosis"), 0);
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn test_negative_review_is_diagnosed_first() {
        let model = negative_model();
        let run = run(
            ReviewInput::new("The package arrived two weeks late."),
            model.clone(),
            RunOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(
            run.output.diagnosis,
            Some(Diagnosis {
                issue_type: "delivery".into(),
                tone: "angry".into(),
                urgency: "high".into(),
            })
        );
        assert_eq!(run.output.response, "We are sorry, a replacement ships today.");
        assert_eq!(
            run.outcome.path(),
            vec!["find_sentiment", "check_sentiment", "run_diagnosis", "negative_response"]
        );

        assert_eq!(model.calls_matching("customer support assistant"), 1);
        let support = model
            .calls()
            .into_iter()
            .find(|c| c.prompt.contains("customer support assistant"))
            .unwrap();
        assert!(support.prompt.contains("\"delivery\" issue"));
        assert!(support.prompt.contains("Urgency: high"));
    }

    #[tokio::test]
    async fn test_out_of_range_diagnosis_fails_step() {
        let model = Arc::new(
            ScriptedGenerator::new()
                .on_json("Determine if the sentiment", json!({"sentiment": "negative"}))
                .on_json(
                    "Diagnose this negative review",
                    json!({"issue_type": "weather", "tone": "angry", "urgency": "high"}),
                ),
        );
        let err = run(ReviewInput::new("Bad."), model, RunOptions::default())
            .await
            .unwrap_err();

        let AppError::Run(err) = err else {
            panic!("expected a run failure, got {err}");
        };
        assert_eq!(err.failed_step(), Some("run_diagnosis"));
        assert!(matches!(err.generation_error(), Some(StepGraphError::SchemaMismatch { .. })));
        assert_eq!(err.record().and_then(|r| r.get_str("sentiment")), Some("negative"));
        assert!(matches!(err, RunError::StepFailed { .. }));
    }

    #[tokio::test]
    async fn test_empty_review_rejected() {
        let model = negative_model();
        let err = run(ReviewInput::new("   "), model.clone(), RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        assert_eq!(model.call_count(), 0);
    }

    #[test]
    fn test_graph_builds() {
        let graph = graph().unwrap();
        assert_eq!(graph.successors("run_diagnosis"), ["negative_response"]);
    }
}

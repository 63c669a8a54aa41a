//! Essay grader.
//!
//! Three evaluators score the essay concurrently, one per [`Dimension`].
//! Each appends its score to `individual_scores`; `evaluate_overall` waits
//! for all three, summarizes their feedback and averages the scores.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use stepgraph_core::traits::TextGenerator;
use stepgraph_core::{ChatMessage, OutputSchema};
use stepgraph_engine::{
    BuildError, FieldKind, GraphBuilder, PartialUpdate, Record, RunOptions, Schema, StepContext,
    StepError, StepGraph, END, START,
};

use crate::{str_field, AppError, AppRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Language,
    Analysis,
    Clarity,
}

impl Dimension {
    /// Edge-declaration order, which is also the order scores merge in.
    pub const ALL: [Dimension; 3] = [Dimension::Language, Dimension::Analysis, Dimension::Clarity];

    pub fn step(self) -> &'static str {
        match self {
            Dimension::Language => "evaluate_language",
            Dimension::Analysis => "evaluate_analysis",
            Dimension::Clarity => "evaluate_clarity",
        }
    }

    fn feedback_field(self) -> &'static str {
        match self {
            Dimension::Language => "language_feedback",
            Dimension::Analysis => "analysis_feedback",
            Dimension::Clarity => "clarity_feedback",
        }
    }

    fn criterion(self) -> &'static str {
        match self {
            Dimension::Language => "LANGUAGE quality",
            Dimension::Analysis => "DEPTH OF ANALYSIS",
            Dimension::Clarity => "CLARITY OF THOUGHT",
        }
    }

    fn heading(self) -> &'static str {
        match self {
            Dimension::Language => "LANGUAGE",
            Dimension::Analysis => "ANALYSIS",
            Dimension::Clarity => "CLARITY",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dimension::Language => "Language",
            Dimension::Analysis => "Analysis",
            Dimension::Clarity => "Clarity",
        };
        f.write_str(name)
    }
}

pub fn schema() -> Schema {
    Schema::new()
        .required("essay", FieldKind::String)
        .optional("language_feedback", FieldKind::String)
        .optional("analysis_feedback", FieldKind::String)
        .optional("clarity_feedback", FieldKind::String)
        .optional("overall_feedback", FieldKind::String)
        .appending("individual_scores")
        .optional("avg_score", FieldKind::Number)
}

fn evaluation_schema() -> OutputSchema {
    OutputSchema::new("essay_evaluation")
        .text("feedback")
        .integer_in("score", 0, 10)
}

async fn evaluate_dimension(
    ctx: StepContext,
    dimension: Dimension,
) -> Result<PartialUpdate, StepError> {
    let prompt = format!(
        "Evaluate {} of this UPSC essay.\nGive feedback + score.\n\nEssay:\n{}",
        dimension.criterion(),
        ctx.record().get_str("essay").unwrap_or_default()
    );
    let out = ctx
        .generator()
        .generate_structured(vec![ChatMessage::user(prompt)], &evaluation_schema())
        .await?;
    let feedback = out.get("feedback").cloned().unwrap_or_default();
    let score = out.get("score").cloned().unwrap_or_default();
    Ok(PartialUpdate::new()
        .set(dimension.feedback_field(), feedback)
        .set("individual_scores", json!([score])))
}

fn scores(record: &Record) -> Vec<i64> {
    record
        .get_list("individual_scores")
        .map(|l| l.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

async fn evaluate_overall(ctx: StepContext) -> Result<PartialUpdate, StepError> {
    let record = ctx.record();
    let scores = scores(record);
    if scores.is_empty() {
        return Err(StepError::failed("no dimension scores to average"));
    }
    let avg = scores.iter().sum::<i64>() as f64 / scores.len() as f64;

    let mut prompt = String::from("Combine these into final UPSC evaluation:\n");
    for dimension in Dimension::ALL {
        prompt.push_str(&format!(
            "\n{}:\n{}\n",
            dimension.heading(),
            record.get_str(dimension.feedback_field()).unwrap_or_default()
        ));
    }
    let summary = ctx.generator().generate(vec![ChatMessage::user(prompt)]).await?;
    Ok(PartialUpdate::new()
        .set("overall_feedback", summary)
        .set("avg_score", avg))
}

pub fn graph() -> Result<StepGraph, BuildError> {
    let mut g = GraphBuilder::new(schema());
    for dimension in Dimension::ALL {
        g.add_transform(dimension.step(), move |ctx| evaluate_dimension(ctx, dimension))
            .add_edge(START, dimension.step());
    }
    g.add_transform("evaluate_overall", evaluate_overall)
        .add_join(Dimension::ALL.map(Dimension::step), "evaluate_overall")
        .add_edge("evaluate_overall", END);
    g.build()
}

#[derive(Debug, Clone)]
pub struct EssayInput {
    pub essay: String,
}

impl EssayInput {
    pub fn new(essay: impl Into<String>) -> Self {
        Self {
            essay: essay.into(),
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.essay.trim().is_empty() {
            return Err(AppError::InvalidInput("essay text is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DimensionScore {
    pub dimension: Dimension,
    pub score: i64,
    pub feedback: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EssayOutput {
    pub dimensions: Vec<DimensionScore>,
    pub overall_feedback: String,
    pub avg_score: f64,
}

impl EssayOutput {
    pub fn from_record(record: &Record) -> Self {
        let dimensions = Dimension::ALL
            .into_iter()
            .zip(scores(record))
            .map(|(dimension, score)| DimensionScore {
                dimension,
                score,
                feedback: str_field(record, dimension.feedback_field()),
            })
            .collect();
        Self {
            dimensions,
            overall_feedback: str_field(record, "overall_feedback"),
            avg_score: record.get_f64("avg_score").unwrap_or(0.0),
        }
    }

    pub fn score(&self, dimension: Dimension) -> Option<i64> {
        self.dimensions
            .iter()
            .find(|d| d.dimension == dimension)
            .map(|d| d.score)
    }
}

impl fmt::Display for EssayOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in &self.dimensions {
            writeln!(f, "{} score: {}/10", d.dimension, d.score)?;
            writeln!(f, "  {}\n", d.feedback)?;
        }
        writeln!(f, "Overall evaluation:\n{}\n", self.overall_feedback)?;
        write!(f, "Average score: {:.2}", self.avg_score)
    }
}

pub async fn run(
    input: EssayInput,
    generator: Arc<dyn TextGenerator>,
    options: RunOptions,
) -> Result<AppRun<EssayOutput>, AppError> {
    input.validate()?;
    let outcome = graph()?
        .run(json!({"essay": input.essay}), generator, options)
        .await?;
    Ok(AppRun {
        output: EssayOutput::from_record(&outcome.record),
        outcome,
    })
}

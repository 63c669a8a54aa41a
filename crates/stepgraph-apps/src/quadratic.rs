use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use stepgraph_core::traits::TextGenerator;
use stepgraph_engine::{
    BuildError, FieldKind, GraphBuilder, PartialUpdate, Record, RouteTag, RunOptions, Schema,
    StepContext, StepError, StepGraph, Target, END, START,
};

use crate::{str_field, AppError, AppRun};

pub fn schema() -> Schema {
    Schema::new()
        .required("a", FieldKind::Number)
        .required("b", FieldKind::Number)
        .required("c", FieldKind::Number)
        .optional("equation", FieldKind::String)
        .optional("discriminant", FieldKind::Number)
        .optional("result", FieldKind::String)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RootKind {
    Real,
    Repeated,
    None,
}

impl RouteTag for RootKind {
    const ALL: &'static [Self] = &[RootKind::Real, RootKind::Repeated, RootKind::None];

    fn as_str(&self) -> &'static str {
        match self {
            RootKind::Real => "real_roots",
            RootKind::Repeated => "repeated_roots",
            RootKind::None => "no_real_roots",
        }
    }
}

fn coefficients(record: &Record) -> (f64, f64, f64) {
    let get = |k| record.get_f64(k).unwrap_or(0.0);
    (get("a"), get("b"), get("c"))
}

async fn show_equation(ctx: StepContext) -> Result<PartialUpdate, StepError> {
    let (a, b, c) = coefficients(ctx.record());
    Ok(PartialUpdate::new().set("equation", format!("{a}x² + {b}x + {c} = 0")))
}

async fn calculate_discriminant(ctx: StepContext) -> Result<PartialUpdate, StepError> {
    let (a, b, c) = coefficients(ctx.record());
    let discriminant = b * b - 4.0 * a * c;
    if !discriminant.is_finite() {
        return Err(StepError::failed(format!(
            "discriminant of {a}x² + {b}x + {c} is out of f64 range"
        )));
    }
    Ok(PartialUpdate::new().set("discriminant", discriminant))
}

fn finite_root(root: f64) -> Result<f64, StepError> {
    if root.is_finite() {
        Ok(root)
    } else {
        Err(StepError::failed("root is out of f64 range"))
    }
}

fn check_condition(record: &Record) -> RootKind {
    let d = record.get_f64("discriminant").unwrap_or(0.0);
    if d > 0.0 {
        RootKind::Real
    } else if d == 0.0 {
        RootKind::Repeated
    } else {
        RootKind::None
    }
}

async fn real_roots(ctx: StepContext) -> Result<PartialUpdate, StepError> {
    let (a, b, _) = coefficients(ctx.record());
    let sqrt_d = ctx.record().get_f64("discriminant").unwrap_or(0.0).sqrt();
    let r1 = finite_root((-b + sqrt_d) / (2.0 * a))?;
    let r2 = finite_root((-b - sqrt_d) / (2.0 * a))?;
    Ok(PartialUpdate::new().set("result", format!("Real Roots: {r1:.4} and {r2:.4}")))
}

async fn repeated_roots(ctx: StepContext) -> Result<PartialUpdate, StepError> {
    let (a, b, _) = coefficients(ctx.record());
    // + 0.0 turns -0.0 into 0.0
    let root = finite_root(-b / (2.0 * a))? + 0.0;
    Ok(PartialUpdate::new().set("result", format!("Repeated Root: {root:.4}")))
}

async fn no_real_roots(_ctx: StepContext) -> Result<PartialUpdate, StepError> {
    Ok(PartialUpdate::new().set("result", "No real roots (Discriminant < 0)"))
}

pub fn graph() -> Result<StepGraph, BuildError> {
    let mut g = GraphBuilder::new(schema());
    g.add_transform("show_equation", show_equation)
        .add_transform("calculate_discriminant", calculate_discriminant)
        .add_router("check_condition", check_condition, |kind| match kind {
            RootKind::Real => Target::step("real_roots"),
            RootKind::Repeated => Target::step("repeated_roots"),
            RootKind::None => Target::step("no_real_roots"),
        })
        .add_transform("real_roots", real_roots)
        .add_transform("repeated_roots", repeated_roots)
        .add_transform("no_real_roots", no_real_roots)
        .add_edge(START, "show_equation")
        .add_edge("show_equation", "calculate_discriminant")
        .add_edge("calculate_discriminant", "check_condition")
        .add_edge("real_roots", END)
        .add_edge("repeated_roots", END)
        .add_edge("no_real_roots", END);
    g.build()
}

/// Coefficients of `a·x² + b·x + c = 0`.
#[derive(Debug, Clone, Copy)]
pub struct QuadraticInput {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl QuadraticInput {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.a == 0.0 {
            return Err(AppError::InvalidInput(
                "coefficient 'a' cannot be zero for a quadratic equation".into(),
            ));
        }
        if ![self.a, self.b, self.c].iter().all(|v| v.is_finite()) {
            return Err(AppError::InvalidInput("coefficients must be finite numbers".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuadraticOutput {
    pub equation: String,
    pub discriminant: f64,
    pub result: String,
}

impl QuadraticOutput {
    pub fn from_record(record: &Record) -> Self {
        Self {
            equation: str_field(record, "equation"),
            discriminant: record.get_f64("discriminant").unwrap_or(0.0),
            result: str_field(record, "result"),
        }
    }
}

impl fmt::Display for QuadraticOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Equation:     {}", self.equation)?;
        writeln!(f, "Discriminant: {}", self.discriminant)?;
        write!(f, "Result:       {}", self.result)
    }
}

/// Solve one equation. No model calls are made; `generator` is only threaded through.
pub async fn run(
    input: QuadraticInput,
    generator: Arc<dyn TextGenerator>,
    options: RunOptions,
) -> Result<AppRun<QuadraticOutput>, AppError> {
    input.validate()?;
    let outcome = graph()?
        .run(
            json!({"a": input.a, "b": input.b, "c": input.c}),
            generator,
            options,
        )
        .await?;
    Ok(AppRun {
        output: QuadraticOutput::from_record(&outcome.record),
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepgraph_engine::RunError;
    use stepgraph_test_utils::ScriptedGenerator;

    async fn solve(a: f64, b: f64, c: f64) -> AppRun<QuadraticOutput> {
        run(
            QuadraticInput { a, b, c },
            Arc::new(ScriptedGenerator::new()),
            RunOptions::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_zero_discriminant_takes_repeated_root_branch() {
        let run = solve(1.0, 2.0, 1.0).await;
        assert_eq!(run.output.discriminant, 0.0);
        assert_eq!(run.output.result, "Repeated Root: -1.0000");
        assert_eq!(run.outcome.executions("repeated_roots"), 1);
        assert_eq!(run.outcome.executions("real_roots"), 0);
    }

    #[tokio::test]
    async fn test_real_roots() {
        let run = solve(1.0, -3.0, 2.0).await;
        assert_eq!(run.output.equation, "1x² + -3x + 2 = 0");
        assert_eq!(run.output.discriminant, 1.0);
        assert_eq!(run.output.result, "Real Roots: 2.0000 and 1.0000");
    }

    #[tokio::test]
    async fn test_no_real_roots() {
        let run = solve(1.0, 0.0, 1.0).await;
        assert_eq!(run.output.discriminant, -4.0);
        assert_eq!(run.output.result, "No real roots (Discriminant < 0)");
        assert_eq!(
            run.outcome.path(),
            vec!["show_equation", "calculate_discriminant", "check_condition", "no_real_roots"]
        );
    }

    #[tokio::test]
    async fn test_repeated_root_at_origin_has_no_negative_zero() {
        let run = solve(2.0, 0.0, 0.0).await;
        assert_eq!(run.output.result, "Repeated Root: 0.0000");
    }

    #[tokio::test]
    async fn test_zero_leading_coefficient_rejected() {
        let err = run(
            QuadraticInput { a: 0.0, b: 1.0, c: 1.0 },
            Arc::new(ScriptedGenerator::new()),
            RunOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    async fn solve_err(a: f64, b: f64, c: f64) -> RunError {
        let err = run(
            QuadraticInput { a, b, c },
            Arc::new(ScriptedGenerator::new()),
            RunOptions::default(),
        )
        .await
        .unwrap_err();
        let AppError::Run(err) = err else {
            panic!("expected a run failure, got {err}");
        };
        err
    }

    #[tokio::test]
    async fn test_discriminant_overflow_fails_step() {
        let err = solve_err(1e200, 1e200, 1.0).await;
        assert_eq!(err.failed_step(), Some("calculate_discriminant"));
        assert!(err.to_string().contains("out of f64 range"));
    }

    #[tokio::test]
    async fn test_root_overflow_fails_step() {
        let err = solve_err(1e-300, 1e10, 0.0).await;
        assert_eq!(err.failed_step(), Some("real_roots"));
    }

    #[test]
    fn test_rendering() {
        let out = QuadraticOutput {
            equation: "1x² + 2x + 1 = 0".into(),
            discriminant: 0.0,
            result: "Repeated Root: -1.0000".into(),
        };
        let text = out.to_string();
        assert!(text.contains("Equation:     1x² + 2x + 1 = 0"));
        assert!(text.ends_with("Result:       Repeated Root: -1.0000"));
    }
}

//! Declared shapes for structured model output.
//!
//! A step that needs more than free text describes the object it expects as
//! an [`OutputSchema`]. The schema renders its own prompt instructions and
//! validates whatever the model returned, so step bodies only ever see
//! conforming values.

use serde_json::{Map, Value};

use crate::error::{Result, StepGraphError};

/// Type of a single structured-output field.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputKind {
    /// Any string.
    Text,
    /// A whole number, optionally bounded (inclusive).
    Integer { min: Option<i64>, max: Option<i64> },
    /// Any JSON number.
    Number,
    Boolean,
    /// One of a fixed set of strings.
    OneOf(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputField {
    pub name: String,
    pub kind: OutputKind,
    pub description: Option<String>,
}

/// The set of named fields a structured generation must produce.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    pub name: String,
    pub fields: Vec<OutputField>,
}

impl OutputSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a field with an explicit kind.
    pub fn field(mut self, name: impl Into<String>, kind: OutputKind) -> Self {
        self.fields.push(OutputField {
            name: name.into(),
            kind,
            description: None,
        });
        self
    }

    /// Add a free-text field.
    pub fn text(self, name: impl Into<String>) -> Self {
        self.field(name, OutputKind::Text)
    }

    /// Add an integer field bounded to `min..=max`.
    pub fn integer_in(self, name: impl Into<String>, min: i64, max: i64) -> Self {
        self.field(
            name,
            OutputKind::Integer {
                min: Some(min),
                max: Some(max),
            },
        )
    }

    /// Add an enumeration field.
    pub fn one_of(self, name: impl Into<String>, values: &[&str]) -> Self {
        self.field(
            name,
            OutputKind::OneOf(values.iter().map(|v| v.to_string()).collect()),
        )
    }

    /// Attach a description to the most recently added field.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        if let Some(last) = self.fields.last_mut() {
            last.description = Some(description.into());
        }
        self
    }

    /// Prompt suffix telling the model exactly which JSON object to emit.
    pub fn instructions(&self) -> String {
        let mut out = String::from(
            "Respond with ONLY a JSON object (no prose, no code fences) with these fields:\n",
        );
        for f in &self.fields {
            let ty = match &f.kind {
                OutputKind::Text => "string".to_string(),
                OutputKind::Integer { min, max } => match (min, max) {
                    (Some(lo), Some(hi)) => format!("integer between {} and {}", lo, hi),
                    (Some(lo), None) => format!("integer >= {}", lo),
                    (None, Some(hi)) => format!("integer <= {}", hi),
                    (None, None) => "integer".to_string(),
                },
                OutputKind::Number => "number".to_string(),
                OutputKind::Boolean => "true or false".to_string(),
                OutputKind::OneOf(values) => format!(
                    "one of {}",
                    values
                        .iter()
                        .map(|v| format!("\"{}\"", v))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            };
            match &f.description {
                Some(d) => out.push_str(&format!("- \"{}\": {} ({})\n", f.name, ty, d)),
                None => out.push_str(&format!("- \"{}\": {}\n", f.name, ty)),
            }
        }
        out
    }

    /// Validate a model response against the schema.
    ///
    /// Returns only the declared fields, normalized: enumeration values are
    /// matched case-insensitively and replaced by their declared spelling,
    /// integral floats and numeric strings are accepted for integer fields.
    /// Undeclared keys are dropped.
    pub fn validate(&self, value: &Value) -> Result<Map<String, Value>> {
        let obj = value
            .as_object()
            .ok_or_else(|| self.mismatch("expected a JSON object"))?;

        let mut out = Map::new();
        for f in &self.fields {
            let raw = obj
                .get(&f.name)
                .ok_or_else(|| self.mismatch(format!("missing field '{}'", f.name)))?;
            out.insert(f.name.clone(), self.check_field(f, raw)?);
        }
        Ok(out)
    }

    fn check_field(&self, f: &OutputField, raw: &Value) -> Result<Value> {
        match &f.kind {
            OutputKind::Text => match raw {
                Value::String(s) => Ok(Value::String(s.clone())),
                _ => Err(self.mismatch(format!("field '{}' must be a string", f.name))),
            },
            OutputKind::Number => match raw {
                Value::Number(_) => Ok(raw.clone()),
                _ => Err(self.mismatch(format!("field '{}' must be a number", f.name))),
            },
            OutputKind::Boolean => match raw {
                Value::Bool(_) => Ok(raw.clone()),
                _ => Err(self.mismatch(format!("field '{}' must be a boolean", f.name))),
            },
            OutputKind::Integer { min, max } => {
                let n = as_integer(raw).ok_or_else(|| {
                    self.mismatch(format!("field '{}' must be an integer", f.name))
                })?;
                if min.is_some_and(|lo| n < lo) || max.is_some_and(|hi| n > hi) {
                    return Err(self.mismatch(format!(
                        "field '{}' = {} is out of range",
                        f.name, n
                    )));
                }
                Ok(Value::from(n))
            }
            OutputKind::OneOf(allowed) => {
                let s = raw.as_str().ok_or_else(|| {
                    self.mismatch(format!("field '{}' must be a string", f.name))
                })?;
                allowed
                    .iter()
                    .find(|a| a.eq_ignore_ascii_case(s.trim()))
                    .map(|a| Value::String(a.clone()))
                    .ok_or_else(|| {
                        self.mismatch(format!(
                            "field '{}' = \"{}\" is not one of [{}]",
                            f.name,
                            s,
                            allowed.join(", ")
                        ))
                    })
            }
        }
    }

    fn mismatch(&self, message: impl Into<String>) -> StepGraphError {
        StepGraphError::SchemaMismatch {
            schema: self.name.clone(),
            message: message.into(),
        }
    }
}

fn as_integer(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evaluation_schema() -> OutputSchema {
        OutputSchema::new("evaluation")
            .text("feedback")
            .integer_in("score", 0, 10)
    }

    #[test]
    fn test_validate_accepts_conforming_object() {
        let out = evaluation_schema()
            .validate(&json!({"feedback": "Clear.", "score": 7}))
            .unwrap();
        assert_eq!(out["feedback"], "Clear.");
        assert_eq!(out["score"], 7);
    }

    #[test]
    fn test_validate_drops_extra_keys() {
        let out = evaluation_schema()
            .validate(&json!({"feedback": "x", "score": 3, "note": "extra"}))
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(!out.contains_key("note"));
    }

    #[test]
    fn test_validate_missing_field() {
        let err = evaluation_schema()
            .validate(&json!({"feedback": "x"}))
            .unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("missing field 'score'"));
    }

    #[test]
    fn test_integer_bounds_and_coercion() {
        let schema = evaluation_schema();
        assert!(schema.validate(&json!({"feedback": "", "score": 11})).is_err());
        assert!(schema.validate(&json!({"feedback": "", "score": -1})).is_err());
        assert!(schema.validate(&json!({"feedback": "", "score": 6.5})).is_err());

        let out = schema.validate(&json!({"feedback": "", "score": 8.0})).unwrap();
        assert_eq!(out["score"], 8);
        let out = schema.validate(&json!({"feedback": "", "score": " 9 "})).unwrap();
        assert_eq!(out["score"], 9);
    }

    #[test]
    fn test_one_of_normalizes_case() {
        let schema = OutputSchema::new("sentiment").one_of("sentiment", &["positive", "negative"]);
        let out = schema.validate(&json!({"sentiment": "Positive"})).unwrap();
        assert_eq!(out["sentiment"], "positive");

        let err = schema.validate(&json!({"sentiment": "mixed"})).unwrap_err();
        assert!(err.to_string().contains("not one of [positive, negative]"));
    }

    #[test]
    fn test_non_object_rejected() {
        let err = evaluation_schema().validate(&json!(["a"])).unwrap_err();
        assert!(err.to_string().contains("expected a JSON object"));
    }

    #[test]
    fn test_instructions_list_every_field() {
        let text = OutputSchema::new("diagnosis")
            .one_of("urgency", &["low", "medium", "high"])
            .describe("how soon support must act")
            .integer_in("score", 0, 10)
            .instructions();
        assert!(text.contains("\"urgency\": one of \"low\", \"medium\", \"high\" (how soon support must act)"));
        assert!(text.contains("\"score\": integer between 0 and 10"));
    }
}

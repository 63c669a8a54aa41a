use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepGraphError {
    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM request timed out after {0}s")]
    LlmTimeout(u64),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    #[error("Structured output for '{schema}' did not match: {message}")]
    SchemaMismatch { schema: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StepGraphError {
    /// Network and timeout failures that a caller may choose to retry.
    ///
    /// Validation failures (unparseable or non-conforming model output) are
    /// not transient: retrying the same prompt is a caller decision.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LlmRequest(_) | Self::LlmTimeout(_) | Self::LlmStream(_)
        )
    }

    /// The model answered, but not in the declared shape.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::LlmParse(_) | Self::SchemaMismatch { .. })
    }
}

pub type Result<T> = std::result::Result<T, StepGraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert!(StepGraphError::LlmRequest("HTTP 503".into()).is_transient());
        assert!(StepGraphError::LlmTimeout(30).is_transient());
        assert!(!StepGraphError::LlmParse("no json".into()).is_transient());

        let mismatch = StepGraphError::SchemaMismatch {
            schema: "sentiment".into(),
            message: "missing field 'sentiment'".into(),
        };
        assert!(mismatch.is_validation());
        assert!(!mismatch.is_transient());
        assert_eq!(
            mismatch.to_string(),
            "Structured output for 'sentiment' did not match: missing field 'sentiment'"
        );
    }

    #[test]
    fn test_config_errors_are_neither() {
        let e = StepGraphError::Config("bad".into());
        assert!(!e.is_transient());
        assert!(!e.is_validation());
    }
}

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use stepgraph_core::config::ModelConfig;
use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::structured::OutputSchema;
use stepgraph_core::traits::{LlmClient, TextGenerator};
use stepgraph_core::types::*;

/// [`TextGenerator`] backed by a streaming [`LlmClient`].
///
/// Deltas are collected into a single string. Structured calls append the
/// schema's instructions to the prompt, ask the provider for JSON, and
/// validate the reply before handing it back.
pub struct LlmGenerator {
    client: Arc<dyn LlmClient>,
    config: ModelConfig,
}

impl LlmGenerator {
    pub fn new(client: Arc<dyn LlmClient>, config: ModelConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    async fn collect(&self, messages: Vec<ChatMessage>, format: ResponseFormat) -> Result<String> {
        let mut stream = self
            .client
            .chat_stream(&self.config, messages, format)
            .await?;

        let mut text = String::new();
        while let Some(delta) = stream.next().await {
            match delta? {
                StreamDelta::TextDelta(t) => text.push_str(&t),
                StreamDelta::Stop(StopReason::MaxTokens) => {
                    warn!(model = %self.config.model_id, "Response truncated at max_tokens");
                }
                StreamDelta::Stop(_) => {}
                StreamDelta::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    debug!(input_tokens, output_tokens, "Token usage");
                }
            }
        }

        if text.trim().is_empty() {
            return Err(StepGraphError::LlmParse("empty response".into()));
        }
        Ok(text)
    }
}

impl TextGenerator for LlmGenerator {
    fn generate(&self, messages: Vec<ChatMessage>) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move { self.collect(messages, ResponseFormat::Text).await })
    }

    fn generate_structured<'a>(
        &'a self,
        mut messages: Vec<ChatMessage>,
        schema: &'a OutputSchema,
    ) -> BoxFuture<'a, Result<Map<String, Value>>> {
        Box::pin(async move {
            messages.push(ChatMessage::user(schema.instructions()));
            let text = self.collect(messages, ResponseFormat::Json).await?;

            let json_str = extract_json(&text);
            let value: Value = serde_json::from_str(json_str).map_err(|e| {
                StepGraphError::LlmParse(format!("{} returned invalid JSON: {}", schema.name, e))
            })?;
            schema.validate(&value)
        })
    }
}

/// Extract a JSON object from model output that may wrap it in code fences or prose.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let after = &trimmed[start + fence.len()..];
            if let Some(end) = after.find("```") {
                return after[..end].trim();
            }
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }
    trimmed
}

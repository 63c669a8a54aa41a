use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use stepgraph_core::config::ModelConfig;
use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::traits::LlmClient;
use stepgraph_core::types::*;

use super::presets;
use crate::streaming::{SseEvent, SseStream};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OaiResponseFormat>,
}

#[derive(Serialize, Debug, PartialEq)]
pub(crate) struct OaiMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct OaiResponseFormat {
    r#type: &'static str,
}

// Response types
#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDeltaContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDeltaContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub(crate) fn convert_messages(messages: Vec<ChatMessage>) -> Vec<OaiMessage> {
    messages
        .into_iter()
        .map(|msg| OaiMessage {
            role: match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: msg.content,
        })
        .collect()
}

/// Resolve the endpoint: explicit `base_url`, then provider preset, then OpenAI.
pub(crate) fn endpoint(config: &ModelConfig) -> String {
    config
        .base_url
        .clone()
        .or_else(|| presets::get_preset(&config.provider).map(|p| p.default_base_url.to_string()))
        .unwrap_or_else(|| OPENAI_API_URL.to_string())
}

pub(crate) fn parse_chunk(event: SseEvent) -> Vec<Result<StreamDelta>> {
    if event.data.trim() == "[DONE]" {
        return vec![];
    }

    let parsed: std::result::Result<StreamChunk, _> = serde_json::from_str(&event.data);
    match parsed {
        Ok(chunk) => {
            let mut deltas = Vec::new();

            if let Some(choice) = chunk.choices.into_iter().next() {
                if let Some(text) = choice.delta.and_then(|d| d.content) {
                    if !text.is_empty() {
                        deltas.push(Ok(StreamDelta::TextDelta(text)));
                    }
                }

                // Ollama puts the last token and finish_reason in the same chunk
                if let Some(reason) = choice.finish_reason {
                    let stop = match reason.as_str() {
                        "length" => StopReason::MaxTokens,
                        "stop_sequence" => StopReason::StopSequence,
                        _ => StopReason::EndTurn,
                    };
                    deltas.push(Ok(StreamDelta::Stop(stop)));
                }
            }

            if let Some(usage) = chunk.usage {
                deltas.push(Ok(StreamDelta::Usage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                }));
            }

            deltas
        }
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse OpenAI SSE chunk");
            vec![]
        }
    }
}

impl LlmClient for OpenAiClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        format: ResponseFormat,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();

        Box::pin(async move {
            let url = endpoint(&config);

            let body = ChatRequest {
                model: config.model_id.clone(),
                messages: convert_messages(messages),
                max_tokens: config.max_tokens,
                temperature: if config.temperature > 0.0 {
                    Some(config.temperature)
                } else {
                    None
                },
                stream: true,
                response_format: match format {
                    ResponseFormat::Json => Some(OaiResponseFormat {
                        r#type: "json_object",
                    }),
                    ResponseFormat::Text => None,
                },
            };

            debug!(url = %url, model = %config.model_id, ?format, "Sending chat request");

            let mut req = self
                .http
                .post(&url)
                .timeout(Duration::from_secs(config.timeout_secs))
                .json(&body);

            if let Some(api_key) = &config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            // Apply extra headers from presets and user config
            let preset = presets::get_preset(&config.provider);
            for (k, v) in presets::build_extra_headers(preset.as_ref(), &config.extra_headers) {
                req = req.header(k, v);
            }

            let response = req.send().await.map_err(|e| {
                if e.is_timeout() {
                    StepGraphError::LlmTimeout(config.timeout_secs)
                } else {
                    StepGraphError::LlmRequest(e.to_string())
                }
            })?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(StepGraphError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            let sse_stream = SseStream::new(response.bytes_stream());

            let delta_stream = sse_stream
                .map(|event| match event {
                    Ok(event) => futures::stream::iter(parse_chunk(event)),
                    Err(e) => futures::stream::iter(vec![Err(e)]),
                })
                .flatten();

            Ok(Box::pin(delta_stream) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event_type: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_parse_text_chunk() {
        let deltas = parse_chunk(event(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#));
        assert_eq!(deltas.len(), 1);
        assert!(matches!(&deltas[0], Ok(StreamDelta::TextDelta(t)) if t == "Hel"));
    }

    #[test]
    fn test_parse_final_chunk_with_text_and_stop() {
        let deltas = parse_chunk(event(
            r#"{"choices":[{"delta":{"content":"!"},"finish_reason":"stop"}]}"#,
        ));
        assert_eq!(deltas.len(), 2);
        assert!(matches!(&deltas[1], Ok(StreamDelta::Stop(StopReason::EndTurn))));
    }

    #[test]
    fn test_parse_length_and_usage() {
        let deltas = parse_chunk(event(
            r#"{"choices":[{"delta":{},"finish_reason":"length"}],"usage":{"prompt_tokens":12,"completion_tokens":34}}"#,
        ));
        assert!(matches!(&deltas[0], Ok(StreamDelta::Stop(StopReason::MaxTokens))));
        assert!(matches!(
            &deltas[1],
            Ok(StreamDelta::Usage { input_tokens: 12, output_tokens: 34 })
        ));
    }

    #[test]
    fn test_parse_done_and_garbage() {
        assert!(parse_chunk(event("[DONE]")).is_empty());
        assert!(parse_chunk(event("not json")).is_empty());
    }

    #[test]
    fn test_endpoint_resolution() {
        let mut config = ModelConfig::default();
        assert_eq!(endpoint(&config), "http://localhost:11434/v1/chat/completions");

        config.base_url = Some("http://gpu-box:8000/v1/chat/completions".into());
        assert_eq!(endpoint(&config), "http://gpu-box:8000/v1/chat/completions");

        config.base_url = None;
        config.provider = "custom".into();
        assert_eq!(endpoint(&config), OPENAI_API_URL);
    }

    #[test]
    fn test_convert_messages_roles() {
        let converted = convert_messages(vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
            ChatMessage::assistant_text("hello"),
        ]);
        let roles: Vec<_> = converted.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
        assert_eq!(converted[1].content, "hi");
    }
}

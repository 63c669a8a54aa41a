use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::structured::OutputSchema;
use crate::types::*;

/// LLM client — provider-level streaming.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        format: ResponseFormat,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// Text generation — the collaborator step bodies call.
///
/// Implementations may be slow and may fail; they never retry on their own.
/// A run holds one shared handle and passes it to every step.
pub trait TextGenerator: Send + Sync + 'static {
    /// Generate free text for a prompt.
    fn generate(&self, messages: Vec<ChatMessage>) -> BoxFuture<'_, Result<String>>;

    /// Generate a JSON object conforming to `schema`.
    ///
    /// The returned map is already validated: every declared field is
    /// present with the declared type, enumerations hold allowed values.
    fn generate_structured<'a>(
        &'a self,
        messages: Vec<ChatMessage>,
        schema: &'a OutputSchema,
    ) -> BoxFuture<'a, Result<serde_json::Map<String, serde_json::Value>>>;
}

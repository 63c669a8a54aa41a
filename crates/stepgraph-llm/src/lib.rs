pub mod generator;
pub mod providers;
pub mod streaming;

use stepgraph_core::config::ModelConfig;
use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::traits::LlmClient;

pub use generator::LlmGenerator;
pub use providers::openai::OpenAiClient;

/// Create an LLM client based on the provider name.
///
/// Every supported provider speaks the OpenAI chat-completions protocol;
/// unknown providers are accepted when a `base_url` is configured.
pub fn create_client(config: &ModelConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider.as_str() {
        p if providers::presets::get_preset(p).is_some() => Ok(Box::new(OpenAiClient::new())),
        _ if config.base_url.is_some() => Ok(Box::new(OpenAiClient::new())),
        other => Err(StepGraphError::UnsupportedProvider(other.to_string())),
    }
}

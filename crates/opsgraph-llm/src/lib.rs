pub mod providers;
pub mod retry;
pub mod streaming;

use std::sync::Arc;

use opsgraph_core::config::{AppConfig, ModelConfig};
use opsgraph_core::traits::LlmClient;

pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create a backend client for the configured provider.
///
/// Every supported provider speaks the OpenAI chat-completions dialect;
/// presets only differ in endpoint and headers.
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    Box::new(OpenAiClient::for_provider(&config.provider))
}

/// Build the shared client for a whole deployment: primary model wrapped
/// with retry and the configured fallback models.
pub fn build_from_config(config: &AppConfig) -> Arc<dyn LlmClient> {
    let fallbacks = config
        .fallback_models
        .iter()
        .map(|fb| (fb.clone(), create_client(fb)))
        .collect();
    Arc::new(RetryingClient::new(
        create_client(&config.model),
        fallbacks,
        config.retry.clone(),
    ))
}

//! LLM integration.
//!
//! Uses rig-core's OpenAI chat-completions client pointed at any compatible
//! endpoint (DeepSeek by default). `RigAdapter` bridges rig's
//! `CompletionModel` trait to our `LlmProvider` trait.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::config::AdvisorConfig;
use crate::error::LlmError;

/// Create an LLM provider from configuration.
///
/// Returns `Ok(None)` when no API key is configured; callers then use
/// their fixed fallback texts.
pub fn create_provider(config: &AdvisorConfig) -> Result<Option<Arc<dyn LlmProvider>>, LlmError> {
    use rig::providers::openai;

    let Some(api_key) = config.api_key.as_ref() else {
        tracing::info!("No LLM API key configured; correction hints use fallback texts");
        return Ok(None);
    };

    let client: openai::CompletionsClient = openai::CompletionsClient::builder()
        .api_key(api_key.expose_secret())
        .base_url(&config.base_url)
        .build()
        .map_err(|e| LlmError::RequestFailed {
            provider: "openai-compatible".to_string(),
            reason: format!("Failed to create client: {e}"),
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!(model = %config.model, base_url = %config.base_url, "Using OpenAI-compatible LLM");
    Ok(Some(Arc::new(RigAdapter::new(model, &config.model))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_key_means_no_provider() {
        let config = AdvisorConfig::default();
        assert!(create_provider(&config).unwrap().is_none());
    }

    #[test]
    fn key_constructs_provider() {
        // The client accepts any key; auth failures surface on the first request.
        let config = AdvisorConfig {
            api_key: Some(secrecy::SecretString::from("sk-test")),
            ..AdvisorConfig::default()
        };
        let provider = create_provider(&config).unwrap().unwrap();
        assert_eq!(provider.model_name(), "deepseek-chat");
    }

    #[test]
    fn custom_base_url_is_accepted() {
        let config = AdvisorConfig {
            api_key: Some(secrecy::SecretString::from("sk-test")),
            base_url: "http://localhost:11434/v1".to_string(),
            model: "local-model".to_string(),
            ..AdvisorConfig::default()
        };
        let provider = create_provider(&config).unwrap().unwrap();
        assert_eq!(provider.model_name(), "local-model");
    }
}

//! OpenRouter chat completion provider
//!
//! OpenRouter speaks the OpenAI chat completions wire format, so this
//! provider delegates to [`OpenAIClient`] pointed at the OpenRouter endpoint
//! with its own token source.

use async_trait::async_trait;

use super::openai::OpenAIClient;
use crate::chat::{ChatClient, ChatMessage, ChatParams, ChatResponse, ProviderInfo};
use crate::error::{KilnError, Result};

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// OpenRouter chat completion provider.
pub struct OpenRouterClient {
    inner: OpenAIClient,
}

impl OpenRouterClient {
    /// Create a new OpenRouter client.
    pub fn new(api_key: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            inner: OpenAIClient::with_base_url(api_key, default_model, OPENROUTER_BASE_URL),
        }
    }

    /// Create from environment variables.
    ///
    /// Reads `OPENROUTER_API_KEY` (required) and `OPENROUTER_MODEL`
    /// (optional).
    pub fn from_env(model: Option<impl Into<String>>) -> Result<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY").map_err(|_| {
            KilnError::Config("OPENROUTER_API_KEY environment variable not set".to_string())
        })?;

        let default_model = model
            .map(|m| m.into())
            .or_else(|| std::env::var("OPENROUTER_MODEL").ok())
            .unwrap_or_else(|| "openai/gpt-4o".to_string());

        Ok(Self::new(api_key, default_model))
    }

    /// Get the default model name.
    pub fn default_model(&self) -> &str {
        self.inner.default_model()
    }
}

#[async_trait]
impl ChatClient for OpenRouterClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatResponse> {
        self.inner.complete(messages, params).await
    }

    fn provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            provider: "openrouter".to_string(),
            model: self.inner.default_model().to_string(),
        }
    }
}

//! Factory for creating chat clients from workflow configuration

use std::sync::Arc;

use crate::chat::providers::{OpenAIClient, OpenRouterClient};
use crate::chat::ChatClient;
use crate::config::ApiProvider;
use crate::error::Result;

/// Factory for creating chat clients
pub struct ChatClientFactory;

impl ChatClientFactory {
    /// Create a chat client for the given provider.
    ///
    /// `api_token` is the already-resolved token from the workflow document
    /// (literal or `$(cmd)` output); when absent the provider falls back to
    /// its environment variable (`OPENAI_API_KEY` / `OPENROUTER_API_KEY`).
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no token can be resolved.
    pub fn create(
        provider: ApiProvider,
        api_token: Option<&str>,
        model: Option<&str>,
    ) -> Result<Arc<dyn ChatClient>> {
        match provider {
            ApiProvider::OpenAi => {
                let client = if let Some(token) = api_token {
                    let model = model
                        .map(|m| m.to_string())
                        .or_else(|| std::env::var("OPENAI_MODEL").ok())
                        .unwrap_or_else(|| "gpt-4o".to_string());
                    OpenAIClient::new(token, model)
                } else {
                    OpenAIClient::from_env(model)?
                };
                Ok(Arc::new(client))
            }
            ApiProvider::OpenRouter => {
                let client = if let Some(token) = api_token {
                    let model = model
                        .map(|m| m.to_string())
                        .or_else(|| std::env::var("OPENROUTER_MODEL").ok())
                        .unwrap_or_else(|| "openai/gpt-4o".to_string());
                    OpenRouterClient::new(token, model)
                } else {
                    OpenRouterClient::from_env(model)?
                };
                Ok(Arc::new(client))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_with_explicit_token() {
        let client = ChatClientFactory::create(ApiProvider::OpenAi, Some("sk-test"), Some("gpt-4o"))
            .unwrap();
        assert_eq!(client.provider_info().provider, "openai");
        assert_eq!(client.provider_info().model, "gpt-4o");
    }

    #[test]
    fn test_create_openrouter_with_explicit_token() {
        let client =
            ChatClientFactory::create(ApiProvider::OpenRouter, Some("sk-or-test"), None).unwrap();
        assert_eq!(client.provider_info().provider, "openrouter");
    }
}

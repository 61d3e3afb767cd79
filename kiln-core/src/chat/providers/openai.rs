//! OpenAI chat completion provider

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chat::{
    ChatClient, ChatMessage, ChatParams, ChatResponse, MessageRole, ProviderInfo, TokenUsage,
    ToolCallRequest,
};
use crate::error::{KilnError, Result};

/// OpenAI chat completion provider (gpt-4o, gpt-4-turbo, etc.).
pub struct OpenAIClient {
    client: reqwest::Client,
    api_key: String,
    default_model: String,
    base_url: String,
}

impl OpenAIClient {
    /// Create a new OpenAI client.
    pub fn new(api_key: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            default_model: default_model.into(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    /// Create with a custom base URL (for Azure OpenAI or compatible APIs).
    pub fn with_base_url(
        api_key: impl Into<String>,
        default_model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            default_model: default_model.into(),
            base_url: base_url.into(),
        }
    }

    /// Create from environment variables.
    ///
    /// Reads `OPENAI_API_KEY` (required), `OPENAI_MODEL` (optional, defaults
    /// to "gpt-4o"), and `OPENAI_BASE_URL` (optional).
    pub fn from_env(model: Option<impl Into<String>>) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            KilnError::Config("OPENAI_API_KEY environment variable not set".to_string())
        })?;

        let default_model = model
            .map(|m| m.into())
            .or_else(|| std::env::var("OPENAI_MODEL").ok())
            .unwrap_or_else(|| "gpt-4o".to_string());

        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            default_model,
            base_url,
        })
    }

    /// Get the default model name.
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<WireResponseFormat>,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    /// JSON-encoded argument string, per the chat completions schema
    arguments: String,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: WireFunctionDef,
}

#[derive(Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize)]
struct WireResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

#[derive(Deserialize)]
struct WireError {
    error: WireErrorDetail,
}

#[derive(Deserialize)]
struct WireErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

fn convert_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|m| WireMessage {
            role: match m.role {
                MessageRole::System => "system".to_string(),
                MessageRole::User => "user".to_string(),
                MessageRole::Assistant => "assistant".to_string(),
                MessageRole::Tool => "tool".to_string(),
            },
            content: m.content.clone(),
            tool_call_id: m.tool_call_id.clone(),
            tool_calls: m
                .tool_calls
                .iter()
                .map(|tc| WireToolCall {
                    id: tc.id.clone(),
                    call_type: "function".to_string(),
                    function: WireFunctionCall {
                        name: tc.name.clone(),
                        arguments: tc.arguments.to_string(),
                    },
                })
                .collect(),
        })
        .collect()
}

fn convert_tool_calls(calls: Vec<WireToolCall>) -> Result<Vec<ToolCallRequest>> {
    calls
        .into_iter()
        .map(|tc| {
            let arguments: serde_json::Value = if tc.function.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&tc.function.arguments).map_err(|e| {
                    KilnError::Chat(format!(
                        "Malformed tool call arguments for '{}': {}",
                        tc.function.name, e
                    ))
                })?
            };
            Ok(ToolCallRequest {
                id: tc.id,
                name: tc.function.name,
                arguments,
            })
        })
        .collect()
}

#[async_trait]
impl ChatClient for OpenAIClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatResponse> {
        let model = if params.model.is_empty() {
            self.default_model.clone()
        } else {
            params.model.clone()
        };

        let request = WireRequest {
            model,
            messages: convert_messages(messages),
            temperature: params.temperature,
            tools: params
                .tools
                .iter()
                .map(|t| WireTool {
                    tool_type: "function".to_string(),
                    function: WireFunctionDef {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
            response_format: params.json_mode.then(|| WireResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| KilnError::Chat(format!("Failed to send completion request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            // Try to parse the provider's structured error format
            let message = match serde_json::from_str::<WireError>(&text) {
                Ok(error) => match error.error.error_type {
                    Some(error_type) => {
                        format!("{} ({})", error.error.message, error_type)
                    }
                    None => error.error.message,
                },
                Err(_) => text,
            };

            return Err(KilnError::ChatHttp { status, message });
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| KilnError::Chat(format!("Failed to parse completion response: {}", e)))?;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| KilnError::Chat("Provider returned no choices".to_string()))?;

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: convert_tool_calls(choice.message.tool_calls)?,
            usage: wire.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }

    fn provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            provider: "openai".to_string(),
            model: self.default_model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = OpenAIClient::new("test-key", "gpt-4o");
        assert_eq!(client.default_model(), "gpt-4o");
        assert_eq!(client.base_url(), "https://api.openai.com/v1");
    }

    #[test]
    fn test_custom_base_url() {
        let client = OpenAIClient::with_base_url("k", "gpt-4", "https://custom.example.com/v1");
        assert_eq!(client.base_url(), "https://custom.example.com/v1");
    }

    #[test]
    fn test_convert_messages_roles() {
        let messages = vec![
            ChatMessage::system("be helpful"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
            ChatMessage::tool("call_1", "42"),
        ];

        let converted = convert_messages(&messages);
        assert_eq!(converted.len(), 4);
        assert_eq!(converted[0].role, "system");
        assert_eq!(converted[1].role, "user");
        assert_eq!(converted[2].role, "assistant");
        assert_eq!(converted[3].role, "tool");
        assert_eq!(converted[3].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_convert_tool_calls_parses_arguments() {
        let calls = vec![WireToolCall {
            id: "call_1".to_string(),
            call_type: "function".to_string(),
            function: WireFunctionCall {
                name: "grep".to_string(),
                arguments: r#"{"pattern":"fn main"}"#.to_string(),
            },
        }];

        let converted = convert_tool_calls(calls).unwrap();
        assert_eq!(converted[0].name, "grep");
        assert_eq!(converted[0].arguments["pattern"], "fn main");
    }

    #[test]
    fn test_convert_tool_calls_empty_arguments() {
        let calls = vec![WireToolCall {
            id: "call_1".to_string(),
            call_type: "function".to_string(),
            function: WireFunctionCall {
                name: "list".to_string(),
                arguments: String::new(),
            },
        }];

        let converted = convert_tool_calls(calls).unwrap();
        assert_eq!(converted[0].arguments, serde_json::json!({}));
    }

    #[test]
    fn test_from_env_missing_key() {
        std::env::remove_var("OPENAI_API_KEY");
        assert!(OpenAIClient::from_env(Some("gpt-4o")).is_err());
    }
}

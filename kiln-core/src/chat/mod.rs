//! Chat client abstraction
//!
//! The engine talks to LLM providers through the [`ChatClient`] trait: one
//! `complete` call per model round-trip, carrying the full transcript and
//! step-scoped parameters. Providers translate to their wire format and
//! report tool-call requests back untouched; the tool loop itself lives in
//! the chat driver, not here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod factory;
pub mod providers;
pub mod retry;

pub use factory::ChatClientFactory;
pub use retry::{with_retry, RetryConfig};

/// Message role in the conversation transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider-assigned call id, echoed back in the tool message
    pub id: String,
    /// Name of the tool to invoke
    pub name: String,
    /// JSON-encoded arguments
    pub arguments: serde_json::Value,
}

/// A message in the conversation transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    /// Set on `Tool` messages: the call this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on `Assistant` messages that requested tool calls
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// A tool result message answering `call_id`.
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Attach the tool calls the assistant requested alongside this content.
    pub fn with_tool_calls(mut self, calls: Vec<ToolCallRequest>) -> Self {
        self.tool_calls = calls;
        self
    }
}

/// Description of a tool offered to the model for one completion call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters
    pub parameters: serde_json::Value,
}

/// Step-scoped parameters for one completion call
#[derive(Debug, Clone, Default)]
pub struct ChatParams {
    /// Model identifier; empty means provider default
    pub model: String,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Ask the provider for a JSON object response
    pub json_mode: bool,
    /// Tools offered to the model (empty = none offered)
    pub tools: Vec<ToolSpec>,
}

impl ChatParams {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_json_mode(mut self, json_mode: bool) -> Self {
        self.json_mode = json_mode;
        self
    }
}

/// Token usage reported by the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Result of one completion call
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Assistant content (may be empty when only tool calls were returned)
    pub content: String,
    /// Tool calls requested by the model, in order
    pub tool_calls: Vec<ToolCallRequest>,
    /// Token usage if the provider reported it
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    /// Whether the model stopped without requesting tools.
    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

/// Provider identification
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub provider: String,
    pub model: String,
}

/// Trait for chat completion providers.
///
/// One call per model round-trip; the caller owns the transcript and the
/// tool loop. Implementations should return `KilnError::ChatHttp` for
/// status-bearing provider failures and `KilnError::Chat` for transport or
/// decoding failures, so the driver's retry policy can classify them.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Run one completion over the given transcript.
    async fn complete(&self, messages: &[ChatMessage], params: &ChatParams)
        -> Result<ChatResponse>;

    /// Identify the provider and its default model.
    fn provider_info(&self) -> ProviderInfo;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::user("hello");
        assert_eq!(msg.role, MessageRole::User);
        assert!(msg.tool_call_id.is_none());

        let tool_msg = ChatMessage::tool("call_1", "result");
        assert_eq!(tool_msg.role, MessageRole::Tool);
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_message_serialization_skips_empty_fields() {
        let msg = ChatMessage::assistant("hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("tool_call_id"));
        assert!(!json.contains("tool_calls"));
    }

    #[test]
    fn test_response_finality() {
        let final_response = ChatResponse {
            content: "done".to_string(),
            tool_calls: Vec::new(),
            usage: None,
        };
        assert!(final_response.is_final());

        let tool_response = ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCallRequest {
                id: "call_1".to_string(),
                name: "grep".to_string(),
                arguments: serde_json::json!({"pattern": "x"}),
            }],
            usage: None,
        };
        assert!(!tool_response.is_final());
    }
}

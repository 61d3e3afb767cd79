//! Chat driver: one prompt turn with the tool-call loop
//!
//! A prompt turn appends the rendered user message, then alternates
//! completion calls and tool dispatch until the model stops requesting
//! tools. The loop depth is bounded to keep a runaway model from spinning
//! forever.

use std::sync::Arc;

use crate::chat::{with_retry, ChatClient, ChatMessage, ChatParams, RetryConfig};
use crate::context::Scope;
use crate::error::{KilnError, Result};
use crate::tools::ToolDispatcher;

/// Default bound on completion rounds within one prompt turn
pub const DEFAULT_MAX_TOOL_DEPTH: usize = 10;

/// Drives prompt turns against a chat client
pub struct ChatDriver {
    client: Arc<dyn ChatClient>,
    dispatcher: Arc<ToolDispatcher>,
    retry: RetryConfig,
    max_tool_depth: usize,
}

impl ChatDriver {
    pub fn new(client: Arc<dyn ChatClient>, dispatcher: Arc<ToolDispatcher>) -> Self {
        Self {
            client,
            dispatcher,
            retry: RetryConfig::default(),
            max_tool_depth: DEFAULT_MAX_TOOL_DEPTH,
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_tool_depth(mut self, depth: usize) -> Self {
        self.max_tool_depth = depth.max(1);
        self
    }

    pub fn client(&self) -> &Arc<dyn ChatClient> {
        &self.client
    }

    /// Execute one prompt turn.
    ///
    /// The user message is appended through the scope (so parallel siblings
    /// buffer correctly), every completion sees the transcript the scope
    /// exposes, and each tool result lands as a tool message. The final
    /// assistant content is the turn's raw response.
    pub async fn prompt_turn(
        &self,
        scope: &Scope,
        prompt: impl Into<String>,
        params: &ChatParams,
        cache_tools: bool,
    ) -> Result<String> {
        scope.append(ChatMessage::user(prompt));

        let mut rounds = 0;
        loop {
            let messages = scope.messages();
            let response = with_retry(&self.retry, || self.client.complete(&messages, params))
                .await
                .map_err(|e| match e {
                    e @ (KilnError::Chat(_) | KilnError::ChatHttp { .. }) => e,
                    other => KilnError::Chat(other.to_string()),
                })?;

            scope.append(
                ChatMessage::assistant(response.content.clone())
                    .with_tool_calls(response.tool_calls.clone()),
            );

            if response.is_final() {
                return Ok(response.content);
            }

            rounds += 1;
            if rounds >= self.max_tool_depth {
                return Err(KilnError::Chat(format!(
                    "tool loop exceeded {} rounds without a final response",
                    self.max_tool_depth
                )));
            }

            for call in &response.tool_calls {
                let message = self.dispatcher.dispatch(call, cache_tools).await?;
                scope.append(message);
            }
        }
    }
}

impl std::fmt::Debug for ChatDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatDriver")
            .field("max_tool_depth", &self.max_tool_depth)
            .finish()
    }
}

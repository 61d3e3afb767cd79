//! Tool trait and failure model
//!
//! Tools are named callables the model may invoke during a chat turn. The
//! engine ships no concrete tools; embedders implement this trait and
//! register instances with the [`ToolRegistry`](super::ToolRegistry).

use async_trait::async_trait;
use serde_json::Value;

use crate::chat::ToolSpec;

/// Failure category for a tool invocation.
///
/// Recoverable failures are returned to the model as a tool message so it
/// can retry or adapt; fatal failures propagate to the scheduler and abort
/// the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFailureKind {
    Recoverable,
    Fatal,
}

/// A failed tool invocation
#[derive(Debug, Clone)]
pub struct ToolFailure {
    pub kind: ToolFailureKind,
    pub message: String,
}

impl ToolFailure {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            kind: ToolFailureKind::Recoverable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ToolFailureKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ToolFailureKind::Fatal
    }
}

impl std::fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ToolFailure {}

/// Core tool trait
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name offered to the model
    fn name(&self) -> &str;

    /// Human-readable description offered to the model
    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters
    fn parameters(&self) -> Value;

    /// Whether calls to this tool must be serialized.
    ///
    /// Tools are assumed non-reentrant only when they declare it; the
    /// dispatcher takes a per-tool lock for `serial` tools.
    fn serial(&self) -> bool {
        false
    }

    /// Whether results may be served from the per-run call cache.
    fn cacheable(&self) -> bool {
        true
    }

    /// Execute the tool.
    async fn invoke(&self, args: Value) -> std::result::Result<Value, ToolFailure>;
}

/// Build the wire-level spec offered to the model for this tool.
pub fn spec_for(tool: &dyn Tool) -> ToolSpec {
    ToolSpec {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters(),
    }
}

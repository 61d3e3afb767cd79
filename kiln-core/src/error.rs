//! Error types for kiln operations

/// Result type for kiln operations
pub type Result<T> = std::result::Result<T, KilnError>;

/// Error types for the kiln engine
#[derive(Debug, thiserror::Error)]
pub enum KilnError {
    /// Invalid workflow document; fatal before execution
    #[error("Configuration error: {0}")]
    Config(String),

    /// `{{…}}` evaluation failed
    #[error("Expression error: {0}")]
    Expression(String),

    /// `$(…)` exited non-zero while `exit_on_error` was in effect
    #[error("Shell command failed with status {status}: {stderr}")]
    ShellFailure {
        status: i32,
        stdout: String,
        stderr: String,
    },

    /// Tool invocation failed fatally (recoverable tool errors are returned
    /// to the model instead of raising)
    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    /// Chat provider returned an error or exhausted retries
    #[error("Chat error: {0}")]
    Chat(String),

    /// Chat provider returned an HTTP error status; the status is carried
    /// so the retry policy can classify it
    #[error("Chat provider returned {status}: {message}")]
    ChatHttp { status: u16, message: String },

    /// Persisted session prefix is incompatible with the current workflow
    #[error("Replay mismatch: {0}")]
    ReplayMismatch(String),

    /// A step failed; carries the step name for the user-visible message
    #[error("Step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<KilnError>,
    },

    /// Execution was cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A step exceeded its timeout
    #[error("Step '{step}' timed out after {timeout_ms}ms")]
    Timeout { step: String, timeout_ms: u64 },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl KilnError {
    /// Wrap an error with the name of the step it occurred in.
    pub fn in_step(self, step: impl Into<String>) -> Self {
        match self {
            // Already attributed; keep the innermost step name.
            KilnError::Step { .. } => self,
            other => KilnError::Step {
                step: step.into(),
                source: Box::new(other),
            },
        }
    }

    /// Whether this error should abort the workflow at the step boundary.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, KilnError::Cancelled(_))
    }

    /// Whether this error was caused by cancellation (possibly wrapped).
    pub fn is_cancellation(&self) -> bool {
        match self {
            KilnError::Cancelled(_) => true,
            KilnError::Step { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }
}

impl From<String> for KilnError {
    fn from(s: String) -> Self {
        KilnError::Other(s)
    }
}

impl From<&str> for KilnError {
    fn from(s: &str) -> Self {
        KilnError::Other(s.to_string())
    }
}

//! # Kiln - Declarative AI Workflow Execution
//!
//! Kiln runs declarative workflows: an ordered list of steps sharing one
//! evolving conversation transcript with an LLM provider. Steps are prompts
//! (optionally invoking tools), shell commands, control-flow constructs
//! (conditionals, loops, case/when, parallel groups), or procedural code
//! registered by the embedding application.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kiln_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let workflow = WorkflowConfig::from_file("workflow.yml")?;
//!
//!     let executor = Executor::builder(workflow)
//!         .session_root(".kiln/sessions")
//!         .build()
//!         .await?;
//!
//!     let outcome = executor.run().await?;
//!     println!("{}", outcome.final_output.raw_response);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **config**: workflow document schema and step compilation
//! - **expr** / **interp**: the `{{…}}` / `$(…)` substitution substrate
//! - **context**: the shared output map, transcript, and scope layering
//! - **chat** / **driver**: provider clients and the per-step tool loop
//! - **tools**: the registry and caching dispatcher for model tool calls
//! - **flow** / **executor**: control flow and the step scheduler
//! - **session**: per-step persistence and deterministic replay
//! - **target**: resolution of the resource a workflow operates on

pub mod chat;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod expr;
pub mod flow;
pub mod interp;
pub mod session;
pub mod shell;
pub mod step;
pub mod target;
pub mod tools;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::chat::{
        ChatClient, ChatClientFactory, ChatMessage, ChatParams, ChatResponse, MessageRole,
        ProviderInfo, RetryConfig, TokenUsage, ToolCallRequest, ToolSpec,
    };
    pub use crate::config::{
        ApiProvider, CompiledStep, FetchSpec, StepOverrides, StepSpec, TargetSpec, WorkflowConfig,
    };
    pub use crate::context::{ContextStore, Scope};
    pub use crate::driver::ChatDriver;
    pub use crate::error::{KilnError, Result};
    pub use crate::events::{EventRegistry, EventSink, ExecutionEvent, TracingSink};
    pub use crate::executor::{Executor, ExecutorBuilder, RunOutcome};
    pub use crate::expr::{MapResolver, VarResolver};
    pub use crate::session::{
        SessionHeader, SessionRecorder, SessionReplayer, StepRecord, SESSION_ROOT,
    };
    pub use crate::step::{ProceduralStep, StepRegistry, StepResult};
    pub use crate::target::ResolvedTarget;
    pub use crate::tools::{Tool, ToolDispatcher, ToolFailure, ToolFailureKind, ToolRegistry};
}

//! Step results and step-name resolution
//!
//! A step name resolves to either a prompt directory (`<name>/prompt.md`
//! beside the workflow file) or a procedural implementation registered by
//! the embedding application. Procedural registrations take precedence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Scope;
use crate::error::{KilnError, Result};
use crate::expr::VarResolver;

/// Result of one executed step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepResult {
    /// Raw text of the step (assistant content, shell stdout, rendered
    /// template)
    pub raw_response: String,
    /// Structured value when the step produced one (json mode, procedural
    /// return, loop aggregation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
    /// Exit status for shell steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    /// Wall-clock duration of the step
    pub duration_ms: u64,
}

impl StepResult {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            raw_response: text.into(),
            ..Default::default()
        }
    }

    /// Build a result from an arbitrary value: strings stay raw text,
    /// anything else is carried structured.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(s) => Self::from_text(s),
            other => Self {
                raw_response: other.to_string(),
                structured: Some(other),
                ..Default::default()
            },
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_exit_status(mut self, status: i32) -> Self {
        self.exit_status = Some(status);
        self
    }

    /// The value stored in the output map for this step.
    pub fn value(&self) -> Value {
        match &self.structured {
            Some(value) => value.clone(),
            None => Value::String(self.raw_response.clone()),
        }
    }

    /// Human-readable rendering for streaming and events.
    pub fn display(&self) -> String {
        self.raw_response.clone()
    }
}

/// A registered procedural step implementation.
#[async_trait]
pub trait ProceduralStep: Send + Sync {
    /// Execute against the current scope; the return value becomes the
    /// step's result.
    async fn call(&self, scope: &Scope) -> Result<Value>;
}

/// Adapter turning a plain closure into a [`ProceduralStep`].
struct FnStep<F>(F);

#[async_trait]
impl<F> ProceduralStep for FnStep<F>
where
    F: Fn(&Scope) -> Result<Value> + Send + Sync,
{
    async fn call(&self, scope: &Scope) -> Result<Value> {
        (self.0)(scope)
    }
}

/// Prompt files loaded from a step's prompt directory
#[derive(Debug, Clone)]
pub struct PromptFiles {
    /// Contents of `prompt.md`
    pub prompt: String,
    /// Contents of `output.txt` if present
    pub output_template: Option<String>,
}

/// What a step name resolved to
#[derive(Clone)]
pub enum StepImpl {
    /// A prompt directory containing `prompt.md`
    PromptDir(PathBuf),
    /// A registered procedural implementation
    Procedural(Arc<dyn ProceduralStep>),
}

impl std::fmt::Debug for StepImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepImpl::PromptDir(dir) => f.debug_tuple("PromptDir").field(dir).finish(),
            StepImpl::Procedural(_) => f.debug_tuple("Procedural").finish(),
        }
    }
}

/// Registry resolving step names to implementations.
///
/// Lookup order: procedural registration first, then a prompt directory
/// under the prompt root (normally the workflow file's directory).
#[derive(Default)]
pub struct StepRegistry {
    procedural: HashMap<String, Arc<dyn ProceduralStep>>,
    prompt_root: Option<PathBuf>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the directory searched for `<name>/prompt.md`.
    pub fn with_prompt_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.prompt_root = Some(root.into());
        self
    }

    /// Register a procedural step. Fails on duplicate names.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        step: Arc<dyn ProceduralStep>,
    ) -> Result<()> {
        let name = name.into();
        if self.procedural.contains_key(&name) {
            return Err(KilnError::Config(format!(
                "procedural step '{}' is already registered",
                name
            )));
        }
        self.procedural.insert(name, step);
        Ok(())
    }

    /// Register a closure as a procedural step.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(&Scope) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnStep(f)))
    }

    /// Resolve a step name. Procedural registrations override prompt
    /// directories.
    pub fn resolve(&self, name: &str) -> Option<StepImpl> {
        if let Some(step) = self.procedural.get(name) {
            return Some(StepImpl::Procedural(step.clone()));
        }
        if let Some(root) = &self.prompt_root {
            let dir = root.join(name);
            if dir.join("prompt.md").is_file() {
                return Some(StepImpl::PromptDir(dir));
            }
        }
        None
    }

    pub fn prompt_root(&self) -> Option<&Path> {
        self.prompt_root.as_deref()
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("procedural", &self.procedural.keys().collect::<Vec<_>>())
            .field("prompt_root", &self.prompt_root)
            .finish()
    }
}

/// Load a step's prompt directory.
pub fn load_prompt_dir(dir: &Path) -> Result<PromptFiles> {
    let prompt = std::fs::read_to_string(dir.join("prompt.md"))?;
    let output_path = dir.join("output.txt");
    let output_template = if output_path.is_file() {
        Some(std::fs::read_to_string(output_path)?)
    } else {
        None
    };
    Ok(PromptFiles {
        prompt,
        output_template,
    })
}

/// Hook for rendering a step's `output.txt` template.
///
/// The engine supplies the template text and a resolver carrying the
/// workflow scope plus `response`; the default renders `{{…}}` with the
/// engine's own evaluator, and embedders may install any template language.
pub type OutputRenderer =
    Arc<dyn Fn(&str, &dyn VarResolver) -> Result<String> + Send + Sync>;

/// Resolver layering the raw model response over a step scope for output
/// template rendering.
pub struct RenderScope<'a> {
    pub base: &'a Scope,
    pub response: Value,
}

impl VarResolver for RenderScope<'_> {
    fn resolve(&self, name: &str) -> Option<Value> {
        if name == "response" {
            return Some(self.response.clone());
        }
        self.base.resolve(name)
    }
}

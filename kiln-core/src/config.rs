//! Workflow document schema and validation
//!
//! A workflow YAML names an ordered list of steps plus global defaults:
//!
//! ```yaml
//! name: code-review
//! model: gpt-4o
//! api_provider: openai
//! tools: [read_file, grep]
//! target: "src/**/*.rs"
//!
//! steps:
//!   - lint: $(cargo clippy --message-format short 2>&1)
//!   - analyze
//!   - "Summarize the findings in {{output['analyze']}}"
//!   - each: "$(ls src)"
//!     as: file
//!     steps:
//!       - "Describe {{file}}"
//!
//! analyze:
//!   model: gpt-4-turbo
//!   json: true
//! ```
//!
//! Top-level keys that are not part of the schema act as per-step override
//! tables when they match a step name, and as workflow variables visible to
//! expressions otherwise.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};
use crate::interp;

/// Chat completion provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiProvider {
    #[default]
    OpenAi,
    OpenRouter,
}

/// Target declaration: a string form (path, glob, dir, URL, `$(cmd)`) or a
/// JSON fetch spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    Text(String),
    Fetch(FetchSpec),
}

/// `{url, options: {method, headers, body}}` target form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSpec {
    pub url: String,
    #[serde(default)]
    pub options: FetchOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchOptions {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub body: Option<String>,
}

/// One element of the `steps:` list, as parsed.
///
/// Classification into step kinds happens in [`CompiledStep::compile`]; the
/// parsed form stays close to the YAML so error messages can echo it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepSpec {
    /// Bare name, raw prompt, or `$(cmd)`
    Name(String),
    /// Parallel group: an element that is itself a sequence
    Group(Vec<StepSpec>),
    /// Mapping form: control flow or a name with a value
    Table(BTreeMap<String, serde_yaml::Value>),
}

/// The workflow document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_provider: ApiProvider,
    /// Literal token or `$(cmd)`; falls back to the provider env var
    #[serde(default)]
    pub api_token: Option<String>,
    /// Tool identifiers to enable from the registry
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub target: Option<TargetSpec>,
    /// Global step timeout; per-step overrides win
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    pub steps: Vec<StepSpec>,
    /// Everything else: per-step override tables and workflow variables
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Per-step overrides resolved from a top-level table
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepOverrides {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub json: Option<bool>,
    #[serde(default)]
    pub api_provider: Option<ApiProvider>,
    #[serde(default)]
    pub exit_on_error: Option<bool>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    /// Opt out of the per-run tool-call cache for this step
    #[serde(default)]
    pub cache: Option<bool>,
    /// Arbitrary step parameters, exposed to expressions
    #[serde(flatten)]
    pub params: BTreeMap<String, serde_yaml::Value>,
}

impl WorkflowConfig {
    /// Parse a workflow document from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WorkflowConfig = serde_yaml::from_str(yaml)
            .map_err(|e| KilnError::Config(format!("invalid workflow document: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a workflow document from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            KilnError::Config(format!("cannot read workflow file '{}': {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Validate the document: compiles every step and checks construct
    /// requirements.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(KilnError::Config("workflow name must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(KilnError::Config("workflow has no steps".to_string()));
        }
        compile_steps(&self.steps)?;
        Ok(())
    }

    /// Compile the step list into executable form.
    pub fn compiled_steps(&self) -> Result<Vec<CompiledStep>> {
        compile_steps(&self.steps)
    }

    /// Overrides for a step, resolved from its top-level table (if any).
    pub fn overrides_for(&self, step_name: &str) -> StepOverrides {
        self.extra
            .get(step_name)
            .and_then(|value| {
                if value.is_mapping() {
                    serde_yaml::from_value(value.clone()).ok()
                } else {
                    None
                }
            })
            .unwrap_or_default()
    }

    /// Workflow variables: top-level extras that are not step-override
    /// tables, converted to JSON values for the expression scope.
    pub fn workflow_vars(&self) -> Vec<(String, serde_json::Value)> {
        let step_names: Vec<String> = self
            .compiled_steps()
            .map(|steps| steps.iter().map(|s| s.display_name().to_string()).collect())
            .unwrap_or_default();

        self.extra
            .iter()
            .filter(|(key, value)| !(value.is_mapping() && step_names.contains(key)))
            .filter_map(|(key, value)| yaml_to_json(value).map(|v| (key.clone(), v)))
            .collect()
    }
}

/// Convert a YAML value to its JSON counterpart.
pub fn yaml_to_json(value: &serde_yaml::Value) -> Option<serde_json::Value> {
    serde_json::to_value(value).ok()
}

/// A step specification classified for execution.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledStep {
    /// Named step: prompt directory or procedural registration
    Reference { name: String },
    /// Inline prompt (bare name containing whitespace); no tools offered
    RawPrompt { text: String },
    /// `$(cmd)`; stored under the explicit key or the command text
    Shell { name: String, command: String },
    /// `if:` / `unless:` with `then:` / `else:` branches
    Conditional {
        name: String,
        condition: String,
        negate: bool,
        then_steps: Vec<CompiledStep>,
        else_steps: Vec<CompiledStep>,
    },
    /// `each:` / `as:` / `steps:`
    Each {
        name: String,
        iterable: String,
        binding: String,
        body: Vec<CompiledStep>,
    },
    /// `repeat:` with `until:` / `max_iterations:` / `steps:`
    Repeat {
        name: String,
        until: Option<String>,
        max_iterations: Option<u64>,
        body: Vec<CompiledStep>,
    },
    /// `case:` / `when:` / `else:`
    Case {
        name: String,
        expr: String,
        when: Vec<(String, Vec<CompiledStep>)>,
        else_steps: Option<Vec<CompiledStep>>,
    },
    /// Nested sequence: run concurrently
    Parallel { steps: Vec<CompiledStep> },
}

impl CompiledStep {
    /// The name this step's result is stored and reported under.
    pub fn display_name(&self) -> &str {
        match self {
            CompiledStep::Reference { name } => name,
            CompiledStep::RawPrompt { text } => text,
            CompiledStep::Shell { name, .. } => name,
            CompiledStep::Conditional { name, .. } => name,
            CompiledStep::Each { name, .. } => name,
            CompiledStep::Repeat { name, .. } => name,
            CompiledStep::Case { name, .. } => name,
            CompiledStep::Parallel { .. } => "parallel",
        }
    }

    /// Compile one parsed spec.
    pub fn compile(spec: &StepSpec) -> Result<CompiledStep> {
        match spec {
            StepSpec::Name(text) => Ok(compile_name(text)),
            StepSpec::Group(specs) => Ok(CompiledStep::Parallel {
                steps: compile_steps(specs)?,
            }),
            StepSpec::Table(map) => compile_table(map),
        }
    }
}

/// Classify a bare string: shell command, raw prompt, or reference.
///
/// Raw-prompt detection looks at the bare, pre-interpolation name: only
/// whitespace in the literal text makes a prompt. `$(…)` spanning the whole
/// string makes a shell step stored under the command text.
fn compile_name(text: &str) -> CompiledStep {
    if let Some(command) = interp::as_shell_command(text) {
        return CompiledStep::Shell {
            name: command.to_string(),
            command: command.to_string(),
        };
    }
    if text.trim().contains(char::is_whitespace) {
        return CompiledStep::RawPrompt {
            text: text.to_string(),
        };
    }
    CompiledStep::Reference {
        name: text.trim().to_string(),
    }
}

fn compile_table(map: &BTreeMap<String, serde_yaml::Value>) -> Result<CompiledStep> {
    // Control-flow mappings carry their reserved key alongside branch keys.
    if map.contains_key("if") || map.contains_key("unless") {
        return compile_conditional(map, None);
    }
    if map.contains_key("each") {
        return compile_each(map, None);
    }
    if map.contains_key("case") {
        return compile_case(map, None);
    }
    if let Some(value) = map.get("repeat") {
        if map.len() == 1 {
            return compile_repeat(value, None);
        }
        return Err(KilnError::Config(
            "repeat takes a mapping with until/max_iterations/steps".to_string(),
        ));
    }

    // Otherwise the sole key is a step name whose value carries modifiers.
    if map.len() != 1 {
        let keys: Vec<&str> = map.keys().map(|k| k.as_str()).collect();
        return Err(KilnError::Config(format!(
            "ambiguous step mapping with keys {:?}",
            keys
        )));
    }
    let (name, value) = map.iter().next().unwrap();

    match value {
        serde_yaml::Value::Null => Ok(CompiledStep::Reference { name: name.clone() }),
        serde_yaml::Value::String(text) => {
            let command = interp::as_shell_command(text).ok_or_else(|| {
                KilnError::Config(format!(
                    "step '{}' has a string value that is not a $(…) command",
                    name
                ))
            })?;
            Ok(CompiledStep::Shell {
                name: name.clone(),
                command: command.to_string(),
            })
        }
        serde_yaml::Value::Mapping(_) => {
            let modifiers: BTreeMap<String, serde_yaml::Value> =
                serde_yaml::from_value(value.clone()).map_err(|e| {
                    KilnError::Config(format!("invalid modifiers for step '{}': {}", name, e))
                })?;

            if modifiers.contains_key("if") || modifiers.contains_key("unless") {
                return compile_conditional(&modifiers, Some(name.clone()));
            }
            if modifiers.contains_key("each") {
                return compile_each(&modifiers, Some(name.clone()));
            }
            if modifiers.contains_key("case") {
                return compile_case(&modifiers, Some(name.clone()));
            }
            if let Some(value) = modifiers.get("repeat") {
                return compile_repeat(value, Some(name.clone()));
            }

            let keys: Vec<&str> = modifiers.keys().map(|k| k.as_str()).collect();
            Err(KilnError::Config(format!(
                "step '{}' carries unsupported modifiers {:?}",
                name, keys
            )))
        }
        other => Err(KilnError::Config(format!(
            "step '{}' has unsupported value {:?}",
            name, other
        ))),
    }
}

fn string_field(
    map: &BTreeMap<String, serde_yaml::Value>,
    key: &str,
    context: &str,
) -> Result<String> {
    match map.get(key) {
        Some(serde_yaml::Value::String(s)) => Ok(s.clone()),
        Some(serde_yaml::Value::Bool(b)) => Ok(b.to_string()),
        Some(other) => Err(KilnError::Config(format!(
            "{}: '{}' must be a string, got {:?}",
            context, key, other
        ))),
        None => Err(KilnError::Config(format!(
            "{}: missing '{}'",
            context, key
        ))),
    }
}

fn steps_field(
    map: &BTreeMap<String, serde_yaml::Value>,
    key: &str,
) -> Result<Option<Vec<CompiledStep>>> {
    match map.get(key) {
        None => Ok(None),
        Some(value) => {
            let specs: Vec<StepSpec> = serde_yaml::from_value(value.clone())
                .map_err(|e| KilnError::Config(format!("invalid '{}' steps: {}", key, e)))?;
            Ok(Some(compile_steps_slice(&specs)?))
        }
    }
}

fn compile_conditional(
    map: &BTreeMap<String, serde_yaml::Value>,
    name: Option<String>,
) -> Result<CompiledStep> {
    let (condition_key, negate) = if map.contains_key("if") {
        ("if", false)
    } else {
        ("unless", true)
    };
    let condition = string_field(map, condition_key, "conditional step")?;

    let mut then_steps = steps_field(map, "then")?.unwrap_or_default();
    let else_steps = steps_field(map, "else")?.unwrap_or_default();

    // Name-keyed guard form: `- analyze: { if: "{{x}}" }` runs the named
    // step as the then-branch.
    if let Some(ref step_name) = name {
        if then_steps.is_empty() && else_steps.is_empty() {
            then_steps = vec![compile_name(step_name)];
        }
    }

    if then_steps.is_empty() && else_steps.is_empty() {
        return Err(KilnError::Config(format!(
            "conditional step needs 'then' or 'else' substeps ({} …)",
            condition_key
        )));
    }

    Ok(CompiledStep::Conditional {
        name: name.unwrap_or_else(|| condition_key.to_string()),
        condition,
        negate,
        then_steps,
        else_steps,
    })
}

fn compile_each(
    map: &BTreeMap<String, serde_yaml::Value>,
    name: Option<String>,
) -> Result<CompiledStep> {
    let iterable = string_field(map, "each", "each step")?;
    let binding = string_field(map, "as", "each step")?;
    let body = steps_field(map, "steps")?
        .ok_or_else(|| KilnError::Config("each step requires 'steps'".to_string()))?;

    Ok(CompiledStep::Each {
        name: name.unwrap_or_else(|| "each".to_string()),
        iterable,
        binding,
        body,
    })
}

fn compile_repeat(value: &serde_yaml::Value, name: Option<String>) -> Result<CompiledStep> {
    let map: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_value(value.clone())
        .map_err(|e| KilnError::Config(format!("invalid repeat step: {}", e)))?;

    let until = match map.get("until") {
        Some(serde_yaml::Value::String(s)) => Some(s.clone()),
        Some(serde_yaml::Value::Bool(b)) => Some(b.to_string()),
        Some(other) => {
            return Err(KilnError::Config(format!(
                "repeat 'until' must be a string, got {:?}",
                other
            )));
        }
        None => None,
    };

    let max_iterations = match map.get("max_iterations") {
        Some(value) => Some(
            serde_yaml::from_value::<u64>(value.clone())
                .map_err(|e| KilnError::Config(format!("invalid max_iterations: {}", e)))?,
        ),
        None => None,
    };

    // Unbounded repeats are only allowed when a stop condition exists.
    if until.is_none() && max_iterations.is_none() {
        return Err(KilnError::Config(
            "repeat requires 'until' or 'max_iterations'".to_string(),
        ));
    }

    let body = steps_field(&map, "steps")?
        .ok_or_else(|| KilnError::Config("repeat step requires 'steps'".to_string()))?;

    Ok(CompiledStep::Repeat {
        name: name.unwrap_or_else(|| "repeat".to_string()),
        until,
        max_iterations,
        body,
    })
}

fn compile_case(
    map: &BTreeMap<String, serde_yaml::Value>,
    name: Option<String>,
) -> Result<CompiledStep> {
    let expr = string_field(map, "case", "case step")?;

    let when_value = map
        .get("when")
        .ok_or_else(|| KilnError::Config("case step requires 'when'".to_string()))?;
    let when_map: Vec<(String, serde_yaml::Value)> = match when_value {
        serde_yaml::Value::Mapping(mapping) => mapping
            .iter()
            .map(|(k, v)| {
                let key = match k {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    other => {
                        return Err(KilnError::Config(format!(
                            "case 'when' key must be scalar, got {:?}",
                            other
                        )));
                    }
                };
                Ok((key, v.clone()))
            })
            .collect::<Result<_>>()?,
        other => {
            return Err(KilnError::Config(format!(
                "case 'when' must be a mapping, got {:?}",
                other
            )));
        }
    };

    let mut when = Vec::with_capacity(when_map.len());
    for (key, value) in when_map {
        let specs: Vec<StepSpec> = serde_yaml::from_value(value)
            .map_err(|e| KilnError::Config(format!("invalid steps for when '{}': {}", key, e)))?;
        when.push((key, compile_steps_slice(&specs)?));
    }

    let else_steps = steps_field(map, "else")?;

    Ok(CompiledStep::Case {
        name: name.unwrap_or_else(|| "case".to_string()),
        expr,
        when,
        else_steps,
    })
}

fn compile_steps_slice(specs: &[StepSpec]) -> Result<Vec<CompiledStep>> {
    specs.iter().map(CompiledStep::compile).collect()
}

/// Compile an ordered step list.
pub fn compile_steps(specs: &[StepSpec]) -> Result<Vec<CompiledStep>> {
    compile_steps_slice(specs)
}

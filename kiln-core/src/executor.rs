//! Workflow executor
//!
//! Walks the compiled step list in order, resolves per-step overrides,
//! dispatches each step to its handler, records results in the shared
//! context, and snapshots the session after every top-level step. Parallel
//! groups run their siblings concurrently over the same context with
//! cooperative cancellation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::chat::{ChatClient, ChatClientFactory, ChatParams, RetryConfig};
use crate::config::{CompiledStep, StepOverrides, WorkflowConfig};
use crate::context::{ContextStore, Scope};
use crate::driver::{ChatDriver, DEFAULT_MAX_TOOL_DEPTH};
use crate::error::{KilnError, Result};
use crate::events::{EventRegistry, ExecutionEvent, TracingSink};
use crate::expr::VarResolver;
use crate::flow;
use crate::interp;
use crate::session::{structure_hash, ReplayState, SessionRecorder, StepRecord};
use crate::step::{
    load_prompt_dir, OutputRenderer, RenderScope, StepImpl, StepRegistry, StepResult,
};
use crate::tools::{ToolDispatcher, ToolRegistry};

/// Outcome of one workflow run
#[derive(Debug)]
pub struct RunOutcome {
    /// The last top-level step's result
    pub final_output: StepResult,
    /// Where the session was persisted, if persistence was enabled
    pub session_dir: Option<PathBuf>,
}

/// Builder for [`Executor`]
pub struct ExecutorBuilder {
    workflow: WorkflowConfig,
    chat_client: Option<Arc<dyn ChatClient>>,
    tool_registry: ToolRegistry,
    step_registry: StepRegistry,
    events: EventRegistry,
    session_root: Option<PathBuf>,
    cancel: CancellationToken,
    target: Option<String>,
    retry: RetryConfig,
    max_tool_depth: usize,
    verbose: bool,
    concise: bool,
    output_renderer: Option<OutputRenderer>,
}

impl ExecutorBuilder {
    pub fn new(workflow: WorkflowConfig) -> Self {
        let mut events = EventRegistry::new();
        events.register(Arc::new(TracingSink));
        Self {
            workflow,
            chat_client: None,
            tool_registry: ToolRegistry::new(),
            step_registry: StepRegistry::new(),
            events,
            session_root: None,
            cancel: CancellationToken::new(),
            target: None,
            retry: RetryConfig::default(),
            max_tool_depth: DEFAULT_MAX_TOOL_DEPTH,
            verbose: false,
            concise: false,
            output_renderer: None,
        }
    }

    /// Inject a chat client (tests, embedders). Without one the builder
    /// constructs a provider from the workflow document.
    pub fn chat_client(mut self, client: Arc<dyn ChatClient>) -> Self {
        self.chat_client = Some(client);
        self
    }

    pub fn tool_registry(mut self, registry: ToolRegistry) -> Self {
        self.tool_registry = registry;
        self
    }

    pub fn step_registry(mut self, registry: StepRegistry) -> Self {
        self.step_registry = registry;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn crate::events::EventSink>) -> Self {
        self.events.register(sink);
        self
    }

    /// Enable session persistence under this root directory.
    pub fn session_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.session_root = Some(root.into());
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The resolved target value for this run (one element of the target
    /// expansion).
    pub fn target(mut self, target: Option<String>) -> Self {
        self.target = target;
        self
    }

    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn max_tool_depth(mut self, depth: usize) -> Self {
        self.max_tool_depth = depth;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn concise(mut self, concise: bool) -> Self {
        self.concise = concise;
        self
    }

    /// Install a custom renderer for `output.txt` templates.
    pub fn output_renderer(mut self, renderer: OutputRenderer) -> Self {
        self.output_renderer = Some(renderer);
        self
    }

    /// Resolve everything and produce an executor for one run.
    pub async fn build(self) -> Result<Executor> {
        let steps = self.workflow.compiled_steps()?;

        // Resolve the API token: literal, `$(cmd)`, or provider env var.
        let api_token = match &self.workflow.api_token {
            Some(spec) => match interp::as_shell_command(spec) {
                Some(command) => {
                    let output = crate::shell::run_checked(command).await?;
                    Some(output.stdout.trim().to_string())
                }
                None => Some(spec.clone()),
            },
            None => None,
        };

        let chat_client = match self.chat_client {
            Some(client) => client,
            None => ChatClientFactory::create(
                self.workflow.api_provider,
                api_token.as_deref(),
                self.workflow.model.as_deref(),
            )?,
        };

        let enabled_tools = self.tool_registry.specs_for(&self.workflow.tools)?;
        let dispatcher = Arc::new(ToolDispatcher::new(
            Arc::new(self.tool_registry),
            self.events.clone(),
        ));

        let store = ContextStore::new(self.events.clone());
        store.set_workflow_var("name", Value::String(self.workflow.name.clone()));
        store.set_workflow_var("verbose", Value::Bool(self.verbose));
        store.set_workflow_var("concise", Value::Bool(self.concise));
        if let Some(target) = &self.target {
            store.set_workflow_var("target", Value::String(target.clone()));
            store.set_workflow_var("file", Value::String(target.clone()));
        }
        for (key, value) in self.workflow.workflow_vars() {
            store.set_workflow_var(key, value);
        }

        let recorder = match &self.session_root {
            Some(root) => {
                let names: Vec<String> =
                    steps.iter().map(|s| s.display_name().to_string()).collect();
                Some(SessionRecorder::create(
                    root,
                    &self.workflow.name,
                    self.target.as_deref(),
                    structure_hash(&names),
                )?)
            }
            None => None,
        };

        let output_renderer = self.output_renderer.unwrap_or_else(|| {
            Arc::new(|template: &str, resolver: &dyn VarResolver| {
                interp::interpolate_exprs(template, resolver)
            })
        });

        Ok(Executor {
            workflow: self.workflow,
            steps,
            chat_client,
            api_token,
            dispatcher,
            enabled_tools,
            step_registry: self.step_registry,
            store,
            events: self.events,
            cancel: self.cancel,
            recorder,
            retry: self.retry,
            max_tool_depth: self.max_tool_depth,
            output_renderer,
        })
    }
}

/// Executes one workflow run.
pub struct Executor {
    workflow: WorkflowConfig,
    steps: Vec<CompiledStep>,
    chat_client: Arc<dyn ChatClient>,
    api_token: Option<String>,
    dispatcher: Arc<ToolDispatcher>,
    enabled_tools: Vec<crate::chat::ToolSpec>,
    step_registry: StepRegistry,
    store: ContextStore,
    events: EventRegistry,
    cancel: CancellationToken,
    recorder: Option<SessionRecorder>,
    retry: RetryConfig,
    max_tool_depth: usize,
    output_renderer: OutputRenderer,
}

impl Executor {
    pub fn builder(workflow: WorkflowConfig) -> ExecutorBuilder {
        ExecutorBuilder::new(workflow)
    }

    /// The display names of the top-level steps, in order.
    pub fn step_names(&self) -> Vec<String> {
        self.steps
            .iter()
            .map(|s| s.display_name().to_string())
            .collect()
    }

    /// Hash of the step structure, for replay compatibility checks.
    pub fn structure_hash(&self) -> String {
        structure_hash(&self.step_names())
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    /// Run the workflow from the beginning.
    pub async fn run(&self) -> Result<RunOutcome> {
        self.run_from(None).await
    }

    /// Run the workflow, optionally resuming from replayed state.
    pub async fn run_from(&self, replay: Option<ReplayState>) -> Result<RunOutcome> {
        let scope = Scope::root(self.store.clone());

        let start_index = match replay {
            Some(state) => {
                for (name, value) in state.outputs {
                    self.store.restore_output(&name, value);
                }
                self.store.restore_transcript(state.transcript);
                state.resume_index
            }
            None => 0,
        };

        let mut last = StepResult::default();
        for (index, step) in self.steps.iter().enumerate() {
            if index < start_index {
                continue;
            }

            let name = step.display_name().to_string();
            let started_at = Utc::now();
            let result = self.execute_one(step, &scope, index).await?;
            scope.record(&name, &result);

            if let Some(recorder) = &self.recorder {
                recorder.record_step(&StepRecord {
                    index,
                    name,
                    started_at,
                    finished_at: Utc::now(),
                    result: result.clone(),
                    transcript_snapshot: self.store.transcript(),
                })?;
            }

            last = result;
        }

        Ok(RunOutcome {
            final_output: last,
            session_dir: self.recorder.as_ref().map(|r| r.dir().to_path_buf()),
        })
    }

    /// Execute one step with events, timeout, and cancellation applied.
    /// Recording is the caller's job (scopes differ between contexts).
    fn execute_one<'a>(
        &'a self,
        step: &'a CompiledStep,
        scope: &'a Scope,
        index: usize,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Box::pin(async move {
            let name = step.display_name().to_string();
            self.events.emit(ExecutionEvent::StepStarted {
                name: name.clone(),
                index,
            });

            let overrides = self.workflow.overrides_for(&name);
            let timeout = overrides.timeout.or(self.workflow.timeout);
            let started = Instant::now();

            let inner = self.execute_step(step, scope, &overrides);
            let outcome = if let Some(timeout_duration) = timeout {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        Err(KilnError::Cancelled("workflow cancelled".to_string()))
                    }
                    result = tokio::time::timeout(timeout_duration, inner) => match result {
                        Ok(result) => result,
                        Err(_) => {
                            let timeout_ms = timeout_duration.as_millis() as u64;
                            self.events.emit(ExecutionEvent::StepTimeout {
                                name: name.clone(),
                                timeout_ms,
                            });
                            return Err(KilnError::Timeout {
                                step: name,
                                timeout_ms,
                            });
                        }
                    },
                }
            } else {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        Err(KilnError::Cancelled("workflow cancelled".to_string()))
                    }
                    result = inner => result,
                }
            };

            match outcome {
                Ok(result) => Ok(result.with_duration(started.elapsed().as_millis() as u64)),
                Err(error) => {
                    if !error.is_cancellation() {
                        self.events.emit(ExecutionEvent::StepFailed {
                            name: name.clone(),
                            error: error.to_string(),
                        });
                    }
                    Err(error.in_step(name))
                }
            }
        })
    }

    /// Run a substep list sequentially, recording each result in the scope.
    /// The list's value is its last substep's result.
    fn execute_steps<'a>(
        &'a self,
        steps: &'a [CompiledStep],
        scope: &'a Scope,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Box::pin(async move {
            let mut last = StepResult::default();
            for (index, step) in steps.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    return Err(KilnError::Cancelled("workflow cancelled".to_string()));
                }
                let result = self.execute_one(step, scope, index).await?;
                scope.record(step.display_name(), &result);
                last = result;
            }
            Ok(last)
        })
    }

    async fn execute_step(
        &self,
        step: &CompiledStep,
        scope: &Scope,
        overrides: &StepOverrides,
    ) -> Result<StepResult> {
        match step {
            CompiledStep::Reference { name } => {
                self.execute_reference(name, scope, overrides).await
            }
            CompiledStep::RawPrompt { text } => {
                self.execute_raw_prompt(text, scope, overrides).await
            }
            CompiledStep::Shell { command, .. } => {
                self.execute_shell(command, scope, overrides).await
            }
            CompiledStep::Conditional {
                condition,
                negate,
                then_steps,
                else_steps,
                ..
            } => {
                let mut truth = flow::evaluate_condition(condition, scope).await?;
                if *negate {
                    truth = !truth;
                }
                let branch = if truth { then_steps } else { else_steps };
                self.execute_steps(branch, scope).await
            }
            CompiledStep::Each {
                iterable,
                binding,
                body,
                ..
            } => {
                let exit_on_error = overrides.exit_on_error.unwrap_or(true);
                let items = flow::resolve_iterable(iterable, scope, exit_on_error).await?;

                let loop_scope = scope.with_local_outputs();
                let mut tails = Vec::with_capacity(items.len());
                for item in items {
                    let iteration = loop_scope
                        .with_bindings(HashMap::from([(binding.clone(), item)]));
                    let tail = self.execute_steps(body, &iteration).await?;
                    tails.push(tail.value());
                }
                Ok(StepResult::from_value(Value::Array(tails)))
            }
            CompiledStep::Repeat {
                name,
                until,
                max_iterations,
                body,
            } => {
                let loop_scope = scope.with_local_outputs();
                let mut tails = Vec::new();
                let mut iterations: u64 = 0;

                loop {
                    let tail = self.execute_steps(body, &loop_scope).await?;
                    tails.push(tail.value());
                    iterations += 1;

                    if let Some(condition) = until {
                        if flow::evaluate_condition(condition, &loop_scope).await? {
                            break;
                        }
                    }
                    if let Some(max) = max_iterations {
                        if iterations >= *max {
                            if until.is_some() {
                                self.events.emit(ExecutionEvent::RepeatExhausted {
                                    name: name.clone(),
                                    iterations,
                                });
                            }
                            break;
                        }
                    }
                }
                Ok(StepResult::from_value(Value::Array(tails)))
            }
            CompiledStep::Case {
                expr,
                when,
                else_steps,
                ..
            } => {
                let scrutinee = flow::case_scrutinee(expr, scope).await?;
                for (key, branch) in when {
                    if key == &scrutinee {
                        return self.execute_steps(branch, scope).await;
                    }
                }
                match else_steps {
                    Some(branch) => self.execute_steps(branch, scope).await,
                    None => Ok(StepResult::default()),
                }
            }
            CompiledStep::Parallel { steps } => self.execute_parallel(steps, scope).await,
        }
    }

    async fn execute_parallel(
        &self,
        siblings: &[CompiledStep],
        scope: &Scope,
    ) -> Result<StepResult> {
        let snapshot = Arc::new(scope.messages());
        let group_token = self.cancel.child_token();

        let futures: Vec<_> = siblings
            .iter()
            .enumerate()
            .map(|(index, sibling)| {
                let sibling_scope = scope.for_parallel_sibling(snapshot.clone());
                let token = group_token.clone();
                async move {
                    let outcome = tokio::select! {
                        _ = token.cancelled() => Err(KilnError::Cancelled(
                            "cancelled by failing sibling".to_string(),
                        )),
                        result = self.execute_one(sibling, &sibling_scope, index) => result,
                    };
                    let outcome = match outcome {
                        Ok(result) => {
                            // Completion order: the transcript block lands
                            // when the sibling finishes.
                            sibling_scope.commit_transcript(scope);
                            sibling_scope.record(sibling.display_name(), &result);
                            Ok(result)
                        }
                        Err(error) => {
                            token.cancel();
                            Err(error)
                        }
                    };
                    (sibling_scope, outcome)
                }
            })
            .collect();

        let outcomes = futures::future::join_all(futures).await;

        // Same-key writes from different siblings are a workflow defect.
        let mut writers: HashMap<String, usize> = HashMap::new();
        for (sibling_scope, _) in &outcomes {
            for key in sibling_scope.tracked_writes() {
                *writers.entry(key).or_default() += 1;
            }
        }
        for (key, count) in writers {
            if count > 1 {
                self.events
                    .emit(ExecutionEvent::ParallelOutputConflict { key });
            }
        }

        let mut values = Vec::with_capacity(outcomes.len());
        let mut first_error: Option<KilnError> = None;
        let mut first_cancelled: Option<KilnError> = None;
        for (_, outcome) in outcomes {
            match outcome {
                Ok(result) => values.push(result.value()),
                Err(error) if error.is_cancellation() => {
                    first_cancelled.get_or_insert(error);
                }
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        if let Some(error) = first_cancelled {
            return Err(error);
        }
        Ok(StepResult::from_value(Value::Array(values)))
    }

    async fn execute_reference(
        &self,
        name: &str,
        scope: &Scope,
        overrides: &StepOverrides,
    ) -> Result<StepResult> {
        // Interpolated names resolve against the live scope.
        let resolved_name = if interp::is_dynamic(name) {
            interp::interpolate(name, scope, overrides.exit_on_error.unwrap_or(true)).await?
        } else {
            name.to_string()
        };

        match self.step_registry.resolve(&resolved_name) {
            Some(StepImpl::Procedural(step)) => {
                let value = step.call(scope).await?;
                Ok(StepResult::from_value(value))
            }
            Some(StepImpl::PromptDir(dir)) => {
                let files = load_prompt_dir(&dir)?;
                let exit_on_error = overrides.exit_on_error.unwrap_or(true);
                let prompt = interp::interpolate(&files.prompt, scope, exit_on_error).await?;

                let params = self.chat_params(overrides, true)?;
                let driver = self.driver_for(overrides)?;
                let response = driver
                    .prompt_turn(scope, prompt, &params, overrides.cache.unwrap_or(true))
                    .await?;

                let structured = if params.json_mode {
                    Some(serde_json::from_str(&response).map_err(|e| {
                        KilnError::Chat(format!("json-mode response is not valid JSON: {}", e))
                    })?)
                } else {
                    None
                };

                let raw = match &files.output_template {
                    Some(template) => {
                        let render_scope = RenderScope {
                            base: scope,
                            response: Value::String(response.clone()),
                        };
                        (self.output_renderer)(template, &render_scope)?
                    }
                    None => response,
                };

                Ok(StepResult {
                    raw_response: raw,
                    structured,
                    exit_status: None,
                    duration_ms: 0,
                })
            }
            None => Err(KilnError::Config(format!(
                "step '{}' is neither a prompt directory nor a registered step",
                resolved_name
            ))),
        }
    }

    async fn execute_raw_prompt(
        &self,
        text: &str,
        scope: &Scope,
        overrides: &StepOverrides,
    ) -> Result<StepResult> {
        let exit_on_error = overrides.exit_on_error.unwrap_or(true);
        let prompt = interp::interpolate(text, scope, exit_on_error).await?;

        // Raw prompts never offer tools and never render templates.
        let params = self.chat_params(overrides, false)?;
        let driver = self.driver_for(overrides)?;
        let response = driver
            .prompt_turn(scope, prompt, &params, overrides.cache.unwrap_or(true))
            .await?;
        Ok(StepResult::from_text(response))
    }

    async fn execute_shell(
        &self,
        command: &str,
        scope: &Scope,
        overrides: &StepOverrides,
    ) -> Result<StepResult> {
        let exit_on_error = overrides.exit_on_error.unwrap_or(true);
        let command = interp::interpolate_exprs(command, scope)?;

        let output = crate::shell::run(&command).await?;
        if !output.success() && exit_on_error {
            return Err(KilnError::ShellFailure {
                status: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        Ok(StepResult::from_text(output.stdout).with_exit_status(output.status))
    }

    /// Build completion parameters from workflow defaults and overrides.
    fn chat_params(&self, overrides: &StepOverrides, offer_tools: bool) -> Result<ChatParams> {
        let model = overrides
            .model
            .clone()
            .or_else(|| self.workflow.model.clone())
            .unwrap_or_default();

        let temperature = overrides
            .params
            .get("temperature")
            .and_then(|v| v.as_f64())
            .map(|t| t as f32);

        let mut params = ChatParams::for_model(model).with_json_mode(overrides.json.unwrap_or(false));
        params.temperature = temperature;
        if offer_tools {
            params = params.with_tools(self.enabled_tools.clone());
        }
        Ok(params)
    }

    /// The chat driver for a step, honoring a per-step provider override.
    fn driver_for(&self, overrides: &StepOverrides) -> Result<ChatDriver> {
        let client = match overrides.api_provider {
            Some(provider) if provider != self.workflow.api_provider => {
                ChatClientFactory::create(
                    provider,
                    self.api_token.as_deref(),
                    overrides.model.as_deref().or(self.workflow.model.as_deref()),
                )?
            }
            _ => self.chat_client.clone(),
        };
        Ok(ChatDriver::new(client, self.dispatcher.clone())
            .with_retry_config(self.retry.clone())
            .with_max_tool_depth(self.max_tool_depth))
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("workflow", &self.workflow.name)
            .field("steps", &self.step_names())
            .finish()
    }
}

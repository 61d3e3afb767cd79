//! Tool dispatch with per-run caching and single-flight execution
//!
//! Resolves tool calls coming back from the model, runs them, and converts
//! the outcome into transcript tool messages. Results are cached per run,
//! keyed by `(tool_name, normalized_args)`; concurrent dispatches for the
//! same key collapse to a single execution whose result every caller
//! observes. Tools declaring `serial` take a per-tool lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::OnceCell;

use crate::chat::{ChatMessage, ToolCallRequest};
use crate::error::{KilnError, Result};
use crate::events::{EventRegistry, ExecutionEvent};

use super::registry::ToolRegistry;
use super::tool::ToolFailure;

type CacheCell = Arc<OnceCell<Value>>;

/// Dispatcher for tool calls within one workflow run
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    cache: Mutex<HashMap<String, CacheCell>>,
    serial_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events: EventRegistry,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, events: EventRegistry) -> Self {
        Self {
            registry,
            cache: Mutex::new(HashMap::new()),
            serial_locks: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Dispatch one tool call and produce its transcript message.
    ///
    /// `use_cache` is the step-level opt-out; the tool's own `cacheable`
    /// flag also applies.
    ///
    /// Recoverable failures come back as a tool message describing the
    /// error; fatal failures raise `KilnError::Tool`.
    pub async fn dispatch(&self, call: &ToolCallRequest, use_cache: bool) -> Result<ChatMessage> {
        let Some(tool) = self.registry.get(&call.name).cloned() else {
            // The model asked for something we never offered; let it adapt.
            return Ok(ChatMessage::tool(
                &call.id,
                format!("Error: unknown tool '{}'", call.name),
            ));
        };

        let started = Instant::now();
        let cache_key = format!("{}\u{0}{}", call.name, normalized_key(&call.arguments));
        let cached_before = use_cache && tool.cacheable() && {
            let cache = self.cache.lock().unwrap();
            cache
                .get(&cache_key)
                .map(|cell| cell.initialized())
                .unwrap_or(false)
        };

        let outcome: std::result::Result<Value, ToolFailure> =
            if use_cache && tool.cacheable() {
                let cell = {
                    let mut cache = self.cache.lock().unwrap();
                    cache.entry(cache_key).or_default().clone()
                };
                cell.get_or_try_init(|| self.run_tool(&tool, call.arguments.clone()))
                    .await
                    .map(|value| value.clone())
            } else {
                self.run_tool(&tool, call.arguments.clone()).await
            };

        let duration_ms = started.elapsed().as_millis() as u64;
        self.events.emit(ExecutionEvent::ToolDispatched {
            tool: call.name.clone(),
            cached: cached_before,
            duration_ms,
        });

        match outcome {
            Ok(value) => Ok(ChatMessage::tool(&call.id, render_value(&value))),
            Err(failure) if failure.is_fatal() => Err(KilnError::Tool {
                tool: call.name.clone(),
                message: failure.message,
            }),
            Err(failure) => Ok(ChatMessage::tool(
                &call.id,
                format!("Error: {}", failure.message),
            )),
        }
    }

    async fn run_tool(
        &self,
        tool: &Arc<dyn super::tool::Tool>,
        args: Value,
    ) -> std::result::Result<Value, ToolFailure> {
        let _guard = if tool.serial() {
            let lock = {
                let mut locks = self.serial_locks.lock().unwrap();
                locks
                    .entry(tool.name().to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                    .clone()
            };
            Some(lock.lock_owned().await)
        } else {
            None
        };

        tool.invoke(args).await
    }
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("tools", &self.registry.names())
            .field("cached_keys", &self.cache.lock().unwrap().len())
            .finish()
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Canonical cache key for tool arguments: object keys sorted recursively,
/// integral floats collapsed to integers.
pub fn normalized_key(args: &Value) -> String {
    canonicalize(args).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
                    return Value::Number((f as i64).into());
                }
            }
            value.clone()
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::tool::{Tool, ToolFailure};
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTool {
        invocations: Arc<AtomicUsize>,
        serial: bool,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "counting"
        }

        fn description(&self) -> &str {
            "Counts its own invocations"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        fn serial(&self) -> bool {
            self.serial
        }

        async fn invoke(&self, _args: Value) -> std::result::Result<Value, ToolFailure> {
            let count = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!(count))
        }
    }

    struct FailingTool {
        fatal: bool,
    }

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "failing"
        }

        fn description(&self) -> &str {
            "Always fails"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        async fn invoke(&self, _args: Value) -> std::result::Result<Value, ToolFailure> {
            if self.fatal {
                Err(ToolFailure::fatal("wrote outside allowed path"))
            } else {
                Err(ToolFailure::recoverable("file not found"))
            }
        }
    }

    fn dispatcher_with(tool: Arc<dyn Tool>) -> ToolDispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(tool).unwrap();
        ToolDispatcher::new(Arc::new(registry), EventRegistry::new())
    }

    fn call_with(args: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: "call_1".to_string(),
            name: "counting".to_string(),
            arguments: args,
        }
    }

    #[test]
    fn test_normalized_key_sorts_and_canonicalizes() {
        let a = json!({"b": 1, "a": {"y": 2.0, "x": 1}});
        let b = json!({"a": {"x": 1, "y": 2}, "b": 1.0});
        assert_eq!(normalized_key(&a), normalized_key(&b));

        let c = json!({"a": {"x": 1, "y": 3}, "b": 1});
        assert_ne!(normalized_key(&a), normalized_key(&c));
    }

    #[tokio::test]
    async fn test_cache_hits_on_normalized_equality() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_with(Arc::new(CountingTool {
            invocations: invocations.clone(),
            serial: false,
        }));

        let msg1 = dispatcher
            .dispatch(&call_with(json!({"n": 1, "m": 2})), true)
            .await
            .unwrap();
        let msg2 = dispatcher
            .dispatch(&call_with(json!({"m": 2.0, "n": 1})), true)
            .await
            .unwrap();

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(msg1.content, msg2.content);
    }

    #[tokio::test]
    async fn test_cache_opt_out_reinvokes() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_with(Arc::new(CountingTool {
            invocations: invocations.clone(),
            serial: false,
        }));

        dispatcher
            .dispatch(&call_with(json!({})), false)
            .await
            .unwrap();
        dispatcher
            .dispatch(&call_with(json!({})), false)
            .await
            .unwrap();

        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_single_flight() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let dispatcher = Arc::new(dispatcher_with(Arc::new(CountingTool {
            invocations: invocations.clone(),
            serial: false,
        })));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                dispatcher
                    .dispatch(&call_with(json!({"same": true})), true)
                    .await
                    .unwrap()
            }));
        }

        let mut contents = Vec::new();
        for handle in handles {
            contents.push(handle.await.unwrap().content);
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert!(contents.iter().all(|c| c == &contents[0]));
    }

    #[tokio::test]
    async fn test_recoverable_failure_becomes_tool_message() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(FailingTool { fatal: false }))
            .unwrap();
        let dispatcher = ToolDispatcher::new(Arc::new(registry), EventRegistry::new());

        let call = ToolCallRequest {
            id: "call_9".to_string(),
            name: "failing".to_string(),
            arguments: json!({}),
        };
        let message = dispatcher.dispatch(&call, true).await.unwrap();
        assert_eq!(message.tool_call_id.as_deref(), Some("call_9"));
        assert!(message.content.contains("file not found"));
    }

    #[tokio::test]
    async fn test_fatal_failure_propagates() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(FailingTool { fatal: true }))
            .unwrap();
        let dispatcher = ToolDispatcher::new(Arc::new(registry), EventRegistry::new());

        let call = ToolCallRequest {
            id: "call_9".to_string(),
            name: "failing".to_string(),
            arguments: json!({}),
        };
        let err = dispatcher.dispatch(&call, true).await.unwrap_err();
        assert!(matches!(err, KilnError::Tool { .. }));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_recoverable() {
        let dispatcher =
            ToolDispatcher::new(Arc::new(ToolRegistry::new()), EventRegistry::new());
        let call = ToolCallRequest {
            id: "call_2".to_string(),
            name: "ghost".to_string(),
            arguments: json!({}),
        };
        let message = dispatcher.dispatch(&call, true).await.unwrap();
        assert!(message.content.contains("unknown tool"));
    }
}

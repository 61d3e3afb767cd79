//! Instrumentation events
//!
//! The engine narrates execution through a small event vocabulary. Sinks
//! register on an [`EventRegistry`]; the engine fans every event out to all
//! of them. A tracing-backed sink ships; the CLI adds a console sink in
//! verbose mode.

use std::sync::Arc;

/// Event emitted during workflow execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// A step began executing
    StepStarted { name: String, index: usize },
    /// A step completed and its result was recorded
    StepFinished {
        name: String,
        duration_ms: u64,
        /// Rendered result preview for streaming output
        output: String,
    },
    /// A step failed fatally
    StepFailed { name: String, error: String },
    /// A step exceeded its timeout
    StepTimeout { name: String, timeout_ms: u64 },
    /// A repeat loop hit max_iterations with its condition still false
    RepeatExhausted { name: String, iterations: u64 },
    /// Two parallel siblings wrote the same output key
    ParallelOutputConflict { key: String },
    /// A tool call was dispatched (or served from cache)
    ToolDispatched {
        tool: String,
        cached: bool,
        duration_ms: u64,
    },
}

impl ExecutionEvent {
    /// Dotted event kind, stable across payload changes.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionEvent::StepStarted { .. } => "step.started",
            ExecutionEvent::StepFinished { .. } => "step.finished",
            ExecutionEvent::StepFailed { .. } => "step.failed",
            ExecutionEvent::StepTimeout { .. } => "step.timeout",
            ExecutionEvent::RepeatExhausted { .. } => "repeat.exhausted",
            ExecutionEvent::ParallelOutputConflict { .. } => "parallel.output_conflict",
            ExecutionEvent::ToolDispatched { .. } => "tool.dispatched",
        }
    }
}

/// Trait for event consumers
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &ExecutionEvent);
}

/// Registry fanning events out to all registered sinks
#[derive(Clone, Default)]
pub struct EventRegistry {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn emit(&self, event: ExecutionEvent) {
        for sink in &self.sinks {
            sink.on_event(&event);
        }
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

/// Sink that forwards events to `tracing`
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_event(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::StepStarted { name, index } => {
                tracing::info!(step = name.as_str(), index, "step started");
            }
            ExecutionEvent::StepFinished {
                name, duration_ms, ..
            } => {
                tracing::info!(step = name.as_str(), duration_ms, "step finished");
            }
            ExecutionEvent::StepFailed { name, error } => {
                tracing::error!(step = name.as_str(), error = error.as_str(), "step failed");
            }
            ExecutionEvent::StepTimeout { name, timeout_ms } => {
                tracing::warn!(step = name.as_str(), timeout_ms, "step timed out");
            }
            ExecutionEvent::RepeatExhausted { name, iterations } => {
                tracing::warn!(step = name.as_str(), iterations, "repeat exhausted");
            }
            ExecutionEvent::ParallelOutputConflict { key } => {
                tracing::warn!(key = key.as_str(), "parallel output conflict");
            }
            ExecutionEvent::ToolDispatched {
                tool,
                cached,
                duration_ms,
            } => {
                tracing::debug!(tool = tool.as_str(), cached, duration_ms, "tool dispatched");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectingSink {
        kinds: Mutex<Vec<&'static str>>,
    }

    impl EventSink for CollectingSink {
        fn on_event(&self, event: &ExecutionEvent) {
            self.kinds.lock().unwrap().push(event.kind());
        }
    }

    #[test]
    fn test_event_kinds() {
        let event = ExecutionEvent::RepeatExhausted {
            name: "loop".to_string(),
            iterations: 3,
        };
        assert_eq!(event.kind(), "repeat.exhausted");
    }

    #[test]
    fn test_registry_fans_out() {
        let sink = Arc::new(CollectingSink {
            kinds: Mutex::new(Vec::new()),
        });

        let mut registry = EventRegistry::new();
        registry.register(sink.clone());
        registry.register(Arc::new(TracingSink));

        registry.emit(ExecutionEvent::StepStarted {
            name: "s1".to_string(),
            index: 0,
        });
        registry.emit(ExecutionEvent::ParallelOutputConflict {
            key: "shared".to_string(),
        });

        let kinds = sink.kinds.lock().unwrap();
        assert_eq!(*kinds, vec!["step.started", "parallel.output_conflict"]);
    }
}

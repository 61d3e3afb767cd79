//! Shared execution context
//!
//! One [`ContextStore`] lives for one workflow run: the output map, the
//! conversation transcript, and the workflow-level variables every
//! expression can see. Every step handler receives the same store; loops
//! and parallel groups layer [`Scope`]s on top of it instead of cloning.
//!
//! The output map and transcript are the only shared mutable state in the
//! engine, each behind its own mutex.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::chat::ChatMessage;
use crate::events::{EventRegistry, ExecutionEvent};
use crate::expr::VarResolver;
use crate::step::StepResult;

/// Shared per-run state: output map, transcript, workflow variables.
#[derive(Clone)]
pub struct ContextStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    outputs: Mutex<HashMap<String, Value>>,
    transcript: Mutex<Vec<ChatMessage>>,
    /// Workflow-level fields visible to expressions (`file`, `verbose`, …)
    workflow_vars: Mutex<HashMap<String, Value>>,
    events: EventRegistry,
}

impl ContextStore {
    pub fn new(events: EventRegistry) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                outputs: Mutex::new(HashMap::new()),
                transcript: Mutex::new(Vec::new()),
                workflow_vars: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Set a workflow-level variable (`file`, `verbose`, configured extras).
    pub fn set_workflow_var(&self, name: impl Into<String>, value: Value) {
        self.inner
            .workflow_vars
            .lock()
            .unwrap()
            .insert(name.into(), value);
    }

    pub fn workflow_var(&self, name: &str) -> Option<Value> {
        self.inner.workflow_vars.lock().unwrap().get(name).cloned()
    }

    /// Record a committed step result and emit `step.finished`.
    pub fn record(&self, name: &str, result: &StepResult) {
        self.inner
            .outputs
            .lock()
            .unwrap()
            .insert(name.to_string(), result.value());
        self.inner.events.emit(ExecutionEvent::StepFinished {
            name: name.to_string(),
            duration_ms: result.duration_ms,
            output: result.display(),
        });
    }

    /// Write an output value without the event (replay restoration).
    pub fn restore_output(&self, name: &str, value: Value) {
        self.inner
            .outputs
            .lock()
            .unwrap()
            .insert(name.to_string(), value);
    }

    pub fn output(&self, name: &str) -> Option<Value> {
        self.inner.outputs.lock().unwrap().get(name).cloned()
    }

    /// Snapshot the whole output map.
    pub fn outputs(&self) -> HashMap<String, Value> {
        self.inner.outputs.lock().unwrap().clone()
    }

    /// Append a message to the shared transcript.
    pub fn append(&self, message: ChatMessage) {
        self.inner.transcript.lock().unwrap().push(message);
    }

    /// Append a contiguous block of messages (parallel sibling commit).
    pub fn append_block(&self, messages: Vec<ChatMessage>) {
        self.inner.transcript.lock().unwrap().extend(messages);
    }

    /// Snapshot the transcript.
    pub fn transcript(&self) -> Vec<ChatMessage> {
        self.inner.transcript.lock().unwrap().clone()
    }

    /// Replace the transcript wholesale (replay restoration).
    pub fn restore_transcript(&self, messages: Vec<ChatMessage>) {
        *self.inner.transcript.lock().unwrap() = messages;
    }

    pub fn events(&self) -> &EventRegistry {
        &self.inner.events
    }
}

impl std::fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextStore")
            .field("outputs", &self.inner.outputs.lock().unwrap().len())
            .field("transcript", &self.inner.transcript.lock().unwrap().len())
            .finish()
    }
}

/// One layer of scope state.
struct Frame {
    /// Loop bindings by their `as` name
    bindings: HashMap<String, Value>,
    /// Present on loop frames: output writes land here and die with the loop
    locals: Option<Mutex<HashMap<String, Value>>>,
    /// Present on parallel-sibling frames: keys written through this frame
    tracked: Option<Mutex<HashSet<String>>>,
    parent: Option<Arc<Frame>>,
}

/// How a scope reads and writes the transcript.
#[derive(Clone)]
enum TranscriptHandle {
    /// Directly against the shared transcript
    Direct,
    /// Against a private buffer over an entry snapshot (parallel siblings)
    Buffered {
        base: Arc<Vec<ChatMessage>>,
        buffer: Arc<Mutex<Vec<ChatMessage>>>,
    },
}

/// A view over the context store with layered bindings.
///
/// Cloning a scope is cheap; child scopes share frames through `Arc`.
#[derive(Clone)]
pub struct Scope {
    store: ContextStore,
    frame: Option<Arc<Frame>>,
    transcript: TranscriptHandle,
}

impl Scope {
    /// Root scope for a run: direct transcript, no layers.
    pub fn root(store: ContextStore) -> Self {
        Self {
            store,
            frame: None,
            transcript: TranscriptHandle::Direct,
        }
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    /// Child scope carrying loop bindings (the `as` name).
    pub fn with_bindings(&self, bindings: HashMap<String, Value>) -> Self {
        Self {
            store: self.store.clone(),
            frame: Some(Arc::new(Frame {
                bindings,
                locals: None,
                tracked: None,
                parent: self.frame.clone(),
            })),
            transcript: self.transcript.clone(),
        }
    }

    /// Child scope whose output writes are loop-local: visible to later
    /// iterations, discarded when the scope is dropped.
    pub fn with_local_outputs(&self) -> Self {
        Self {
            store: self.store.clone(),
            frame: Some(Arc::new(Frame {
                bindings: HashMap::new(),
                locals: Some(Mutex::new(HashMap::new())),
                tracked: None,
                parent: self.frame.clone(),
            })),
            transcript: self.transcript.clone(),
        }
    }

    /// Child scope for a parallel sibling: buffered transcript over an entry
    /// snapshot, plus write tracking for conflict detection.
    pub fn for_parallel_sibling(&self, snapshot: Arc<Vec<ChatMessage>>) -> Self {
        Self {
            store: self.store.clone(),
            frame: Some(Arc::new(Frame {
                bindings: HashMap::new(),
                locals: None,
                tracked: Some(Mutex::new(HashSet::new())),
                parent: self.frame.clone(),
            })),
            transcript: TranscriptHandle::Buffered {
                base: snapshot,
                buffer: Arc::new(Mutex::new(Vec::new())),
            },
        }
    }

    /// Resolve a loop binding by name.
    pub fn binding(&self, name: &str) -> Option<Value> {
        let mut frame = self.frame.as_ref();
        while let Some(f) = frame {
            if let Some(value) = f.bindings.get(name) {
                return Some(value.clone());
            }
            frame = f.parent.as_ref();
        }
        None
    }

    /// Read an output, checking loop-local overlays before the store.
    pub fn output(&self, name: &str) -> Option<Value> {
        let mut frame = self.frame.as_ref();
        while let Some(f) = frame {
            if let Some(locals) = &f.locals {
                if let Some(value) = locals.lock().unwrap().get(name) {
                    return Some(value.clone());
                }
            }
            frame = f.parent.as_ref();
        }
        self.store.output(name)
    }

    /// Record a step result through this scope.
    ///
    /// The write lands in the nearest loop-local overlay if one exists,
    /// otherwise in the store (which emits `step.finished`). Every tracking
    /// frame on the way observes the key.
    pub fn record(&self, name: &str, result: &StepResult) {
        let mut frame = self.frame.as_ref();
        while let Some(f) = frame {
            if let Some(tracked) = &f.tracked {
                tracked.lock().unwrap().insert(name.to_string());
            }
            if let Some(locals) = &f.locals {
                locals
                    .lock()
                    .unwrap()
                    .insert(name.to_string(), result.value());
                return;
            }
            frame = f.parent.as_ref();
        }
        self.store.record(name, result);
    }

    /// Keys recorded through this scope's nearest tracking frame.
    pub fn tracked_writes(&self) -> HashSet<String> {
        let mut frame = self.frame.as_ref();
        while let Some(f) = frame {
            if let Some(tracked) = &f.tracked {
                return tracked.lock().unwrap().clone();
            }
            frame = f.parent.as_ref();
        }
        HashSet::new()
    }

    /// Merged view of the output map as a JSON object, inner layers
    /// shadowing outer ones. This is what `output` resolves to in
    /// expressions.
    pub fn outputs_object(&self) -> Value {
        let mut merged = self.store.outputs();

        // Collect overlay layers outermost-first so inner wins on extend.
        let mut layers = Vec::new();
        let mut frame = self.frame.as_ref();
        while let Some(f) = frame {
            if let Some(locals) = &f.locals {
                layers.push(locals.lock().unwrap().clone());
            }
            frame = f.parent.as_ref();
        }
        for layer in layers.into_iter().rev() {
            merged.extend(layer);
        }

        Value::Object(merged.into_iter().collect())
    }

    /// Append a message through this scope's transcript handle.
    pub fn append(&self, message: ChatMessage) {
        match &self.transcript {
            TranscriptHandle::Direct => self.store.append(message),
            TranscriptHandle::Buffered { buffer, .. } => {
                buffer.lock().unwrap().push(message);
            }
        }
    }

    /// Append a contiguous block atomically through this scope's handle.
    pub fn append_messages(&self, messages: Vec<ChatMessage>) {
        if messages.is_empty() {
            return;
        }
        match &self.transcript {
            TranscriptHandle::Direct => self.store.append_block(messages),
            TranscriptHandle::Buffered { buffer, .. } => {
                buffer.lock().unwrap().extend(messages);
            }
        }
    }

    /// The transcript this scope sees: the shared transcript, or the entry
    /// snapshot plus buffered messages for a parallel sibling.
    pub fn messages(&self) -> Vec<ChatMessage> {
        match &self.transcript {
            TranscriptHandle::Direct => self.store.transcript(),
            TranscriptHandle::Buffered { base, buffer } => {
                let mut messages = (**base).clone();
                messages.extend(buffer.lock().unwrap().iter().cloned());
                messages
            }
        }
    }

    /// Commit a parallel sibling's buffered messages as one contiguous
    /// block into the parent scope (so nested groups stay contiguous in
    /// their enclosing sibling's buffer). No-op for direct scopes.
    pub fn commit_transcript(&self, parent: &Scope) {
        if let TranscriptHandle::Buffered { buffer, .. } = &self.transcript {
            let messages = std::mem::take(&mut *buffer.lock().unwrap());
            parent.append_messages(messages);
        }
    }
}

impl VarResolver for Scope {
    fn resolve(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.binding(name) {
            return Some(value);
        }
        if name == "output" {
            return Some(self.outputs_object());
        }
        self.store.workflow_var(name)
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("layered", &self.frame.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ContextStore {
        ContextStore::new(EventRegistry::new())
    }

    fn result_of(value: Value) -> StepResult {
        StepResult::from_value(value)
    }

    #[test]
    fn test_record_and_read() {
        let store = store();
        let scope = Scope::root(store.clone());

        scope.record("s1", &result_of(json!("hi\n")));
        assert_eq!(scope.output("s1"), Some(json!("hi\n")));
        assert_eq!(store.output("s1"), Some(json!("hi\n")));
    }

    #[test]
    fn test_bindings_shadow_and_pop() {
        let store = store();
        let scope = Scope::root(store);
        let child = scope.with_bindings(HashMap::from([("x".to_string(), json!("a"))]));
        let grandchild = child.with_bindings(HashMap::from([("x".to_string(), json!("b"))]));

        assert_eq!(child.binding("x"), Some(json!("a")));
        assert_eq!(grandchild.binding("x"), Some(json!("b")));
        assert_eq!(scope.binding("x"), None);
    }

    #[test]
    fn test_loop_local_outputs_discarded() {
        let store = store();
        let root = Scope::root(store.clone());
        root.record("before", &result_of(json!("kept")));

        {
            let loop_scope = root.with_local_outputs();
            loop_scope.record("inner", &result_of(json!("one")));
            // Visible within the loop, including across iterations.
            assert_eq!(loop_scope.output("inner"), Some(json!("one")));
            loop_scope.record("inner", &result_of(json!("two")));
            assert_eq!(loop_scope.output("inner"), Some(json!("two")));
            // Outer values still readable through the overlay.
            assert_eq!(loop_scope.output("before"), Some(json!("kept")));
        }

        // The overlay is gone with the scope.
        assert_eq!(root.output("inner"), None);
        assert_eq!(store.output("inner"), None);
    }

    #[test]
    fn test_outputs_object_merges_layers() {
        let store = store();
        let root = Scope::root(store);
        root.record("a", &result_of(json!(1)));

        let loop_scope = root.with_local_outputs();
        loop_scope.record("b", &result_of(json!(2)));

        let object = loop_scope.outputs_object();
        assert_eq!(object["a"], json!(1));
        assert_eq!(object["b"], json!(2));

        // The root never saw "b".
        assert_eq!(root.outputs_object().get("b"), None);
    }

    #[test]
    fn test_var_resolution_order() {
        let store = store();
        store.set_workflow_var("verbose", json!(true));
        store.set_workflow_var("x", json!("workflow"));

        let scope = Scope::root(store);
        let child = scope.with_bindings(HashMap::from([("x".to_string(), json!("binding"))]));

        // Loop binding shadows the workflow field.
        assert_eq!(child.resolve("x"), Some(json!("binding")));
        assert_eq!(scope.resolve("x"), Some(json!("workflow")));
        assert_eq!(scope.resolve("verbose"), Some(json!(true)));
        assert!(scope.resolve("output").unwrap().is_object());
        assert_eq!(scope.resolve("nothing"), None);
    }

    #[test]
    fn test_parallel_sibling_transcript_isolation() {
        let store = store();
        let root = Scope::root(store.clone());
        root.append(ChatMessage::user("before group"));

        let snapshot = Arc::new(store.transcript());
        let sibling_a = root.for_parallel_sibling(snapshot.clone());
        let sibling_b = root.for_parallel_sibling(snapshot);

        sibling_a.append(ChatMessage::user("a1"));
        sibling_b.append(ChatMessage::user("b1"));
        sibling_a.append(ChatMessage::assistant("a2"));

        // Each sibling sees the snapshot plus only its own messages.
        assert_eq!(sibling_a.messages().len(), 3);
        assert_eq!(sibling_b.messages().len(), 2);
        assert_eq!(store.transcript().len(), 1);

        // Commit in completion order: contiguous blocks.
        sibling_b.commit_transcript(&root);
        sibling_a.commit_transcript(&root);

        let transcript = store.transcript();
        let contents: Vec<&str> = transcript.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["before group", "b1", "a1", "a2"]);
    }

    #[test]
    fn test_parallel_sibling_write_tracking() {
        let store = store();
        let root = Scope::root(store.clone());
        let snapshot = Arc::new(Vec::new());

        let sibling = root.for_parallel_sibling(snapshot);
        sibling.record("shared", &result_of(json!("x")));
        sibling.record("own", &result_of(json!("y")));

        let tracked = sibling.tracked_writes();
        assert!(tracked.contains("shared"));
        assert!(tracked.contains("own"));
        // Writes still land in the store (last writer wins).
        assert_eq!(store.output("shared"), Some(json!("x")));
    }
}

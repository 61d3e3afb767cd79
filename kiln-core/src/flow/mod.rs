//! Control-flow evaluation helpers
//!
//! Conditions, iterables, and case scrutinees all start from the same
//! coercion ladder over a step-spec string:
//!
//! 1. `{{…}}` — expression truthiness / value
//! 2. `$(…)` — shell command (exit status or stdout, depending on construct)
//! 3. bare `"true"` / `"false"` — literal, no evaluation
//! 4. anything else — a step name resolved against the output map
//!
//! The execution of the constructs themselves (branch selection, iteration,
//! sibling spawning) lives in the executor; these helpers keep the ladder
//! in one place.

mod condition;
mod iterate;

pub use condition::{case_scrutinee, evaluate_condition};
pub use iterate::resolve_iterable;

//! Iterable resolution for `each` loops

use serde_json::Value;

use crate::context::Scope;
use crate::error::{KilnError, Result};
use crate::expr;
use crate::interp;
use crate::shell;

/// Resolve an `each:` value to the list of per-iteration binding values.
///
/// Shell output splits into trimmed, non-empty lines; expression results
/// iterate arrays element-wise and strings line-wise; a bare string reads
/// the named step's output from the scope.
pub async fn resolve_iterable(
    raw: &str,
    scope: &Scope,
    exit_on_error: bool,
) -> Result<Vec<Value>> {
    let trimmed = raw.trim();

    if let Some(command) = interp::as_shell_command(trimmed) {
        // The command itself may carry expressions.
        let command = interp::interpolate_exprs(command, scope)?;
        let output = if exit_on_error {
            shell::run_checked(&command).await?
        } else {
            shell::run(&command).await?
        };
        return Ok(output.lines().into_iter().map(Value::String).collect());
    }

    if interp::contains_expr(trimmed) {
        let value = if let Some(source) = sole_expression(trimmed) {
            expr::evaluate(source, scope)?
        } else {
            Value::String(interp::interpolate(trimmed, scope, exit_on_error).await?)
        };
        return elements_of(value, trimmed);
    }

    // A bare step name: iterate the recorded output.
    let value = scope.output(trimmed).ok_or_else(|| {
        KilnError::Expression(format!(
            "each refers to '{}', which has no recorded output",
            trimmed
        ))
    })?;
    elements_of(value, trimmed)
}

fn elements_of(value: Value, source: &str) -> Result<Vec<Value>> {
    match value {
        // Lists coerce element-wise to their values (strings stay strings).
        Value::Array(items) => Ok(items),
        Value::String(text) => Ok(text
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .map(|l| Value::String(l.to_string()))
            .collect()),
        other => Err(KilnError::Expression(format!(
            "each over '{}' needs a list or string, got {}",
            source,
            match other {
                Value::Null => "null",
                Value::Bool(_) => "bool",
                Value::Number(_) => "number",
                Value::Object(_) => "object",
                _ => unreachable!(),
            }
        ))),
    }
}

fn sole_expression(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") {
        return None;
    }
    Some(inner.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextStore;
    use crate::events::EventRegistry;
    use crate::step::StepResult;
    use serde_json::json;

    fn scope() -> Scope {
        Scope::root(ContextStore::new(EventRegistry::new()))
    }

    #[tokio::test]
    async fn test_shell_iterable_splits_lines() {
        let scope = scope();
        let items = resolve_iterable("$(printf 'a\\nb\\nc\\n')", &scope, true)
            .await
            .unwrap();
        assert_eq!(items, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test]
    async fn test_shell_iterable_failure_honors_exit_on_error() {
        let scope = scope();
        assert!(resolve_iterable("$(exit 1)", &scope, true).await.is_err());
        let items = resolve_iterable("$(exit 1)", &scope, false).await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_expression_array_iterable() {
        let scope = scope();
        scope.record(
            "files",
            &StepResult::from_value(json!(["a.rs", "b.rs"])),
        );
        let items = resolve_iterable("{{output['files']}}", &scope, true)
            .await
            .unwrap();
        assert_eq!(items, vec![json!("a.rs"), json!("b.rs")]);
    }

    #[tokio::test]
    async fn test_step_name_iterable() {
        let scope = scope();
        scope.record("listing", &StepResult::from_text("x\ny\n"));
        let items = resolve_iterable("listing", &scope, true).await.unwrap();
        assert_eq!(items, vec![json!("x"), json!("y")]);
    }

    #[tokio::test]
    async fn test_unknown_step_name_errors() {
        let scope = scope();
        assert!(resolve_iterable("nothing", &scope, true).await.is_err());
    }

    #[tokio::test]
    async fn test_non_iterable_value_errors() {
        let scope = scope();
        scope.record("n", &StepResult::from_value(json!(42)));
        assert!(resolve_iterable("n", &scope, true).await.is_err());
    }
}

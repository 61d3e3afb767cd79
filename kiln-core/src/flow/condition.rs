//! Condition and case-scrutinee coercion

use serde_json::Value;

use crate::context::Scope;
use crate::error::Result;
use crate::expr::{self, is_truthy};
use crate::interp;
use crate::shell;

/// Evaluate a condition string with the coercion ladder.
///
/// `{{…}}` takes the expression's truthiness; `$(…)` is true on exit 0;
/// bare `"true"`/`"false"` short-circuit without evaluation; any other
/// string is a step name whose recorded output decides.
pub async fn evaluate_condition(raw: &str, scope: &Scope) -> Result<bool> {
    let trimmed = raw.trim();

    // Literal booleans short-circuit before any evaluation.
    match trimmed {
        "true" => return Ok(true),
        "false" => return Ok(false),
        _ => {}
    }

    if interp::contains_expr(trimmed) {
        // A single {{…}} keeps its typed value; mixed text is interpolated
        // and judged as a string.
        if let Some(source) = sole_expression(trimmed) {
            let value = expr::evaluate(source, scope)?;
            return Ok(is_truthy(&value));
        }
        let rendered = interp::interpolate_exprs(trimmed, scope)?;
        return Ok(is_truthy(&Value::String(rendered.trim().to_string())));
    }

    if let Some(command) = interp::as_shell_command(trimmed) {
        let output = shell::run(command).await?;
        return Ok(output.success());
    }

    // A step name: truthiness of its recorded output, false when absent.
    Ok(scope
        .output(trimmed)
        .map(|value| is_truthy(&value))
        .unwrap_or(false))
}

/// Evaluate a case expression to the string compared against `when` keys.
pub async fn case_scrutinee(raw: &str, scope: &Scope) -> Result<String> {
    let trimmed = raw.trim();

    if interp::is_dynamic(trimmed) {
        let rendered = interp::interpolate(trimmed, scope, true).await?;
        return Ok(rendered.trim().to_string());
    }

    // A bare step name reads the output map; anything else is literal.
    if let Some(value) = scope.output(trimmed) {
        return Ok(expr::display_value(&value).trim().to_string());
    }
    Ok(trimmed.to_string())
}

/// If the whole string is a single `{{ … }}`, return the inner source.
fn sole_expression(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("{{")?.strip_suffix("}}")?;
    // A second opener means mixed text, not a sole expression.
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
    async fn test_literal_booleans() {
        let scope = scope();
        assert!(evaluate_condition("true", &scope).await.unwrap());
        assert!(!evaluate_condition("false", &scope).await.unwrap());
        assert!(!evaluate_condition("  false  ", &scope).await.unwrap());
    }

    #[tokio::test]
    async fn test_expression_truthiness() {
        let scope = scope();
        scope.record("count", &StepResult::from_value(json!(3)));

        assert!(evaluate_condition("{{output['count'] > 2}}", &scope)
            .await
            .unwrap());
        assert!(!evaluate_condition("{{output['count'] > 5}}", &scope)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_shell_exit_code() {
        let scope = scope();
        assert!(evaluate_condition("$(exit 0)", &scope).await.unwrap());
        assert!(!evaluate_condition("$(exit 1)", &scope).await.unwrap());
    }

    #[tokio::test]
    async fn test_step_name_reference() {
        let scope = scope();
        scope.record("found", &StepResult::from_text("yes"));
        scope.record("empty", &StepResult::from_text(""));

        assert!(evaluate_condition("found", &scope).await.unwrap());
        assert!(!evaluate_condition("empty", &scope).await.unwrap());
        // Unknown step name reads as false.
        assert!(!evaluate_condition("never_ran", &scope).await.unwrap());
    }

    #[tokio::test]
    async fn test_case_scrutinee_forms() {
        let scope = scope();
        scope.record("detect", &StepResult::from_text("rust\n"));

        assert_eq!(case_scrutinee("detect", &scope).await.unwrap(), "rust");
        assert_eq!(
            case_scrutinee("{{output['detect']}}", &scope).await.unwrap(),
            "rust"
        );
        assert_eq!(
            case_scrutinee("$(printf rust)", &scope).await.unwrap(),
            "rust"
        );
        assert_eq!(case_scrutinee("literal", &scope).await.unwrap(), "literal");
    }

    #[test]
    fn test_sole_expression_detection() {
        assert_eq!(sole_expression("{{ a + b }}"), Some("a + b"));
        assert_eq!(sole_expression("x {{a}}"), None);
        assert_eq!(sole_expression("{{a}} and {{b}}"), None);
    }
}

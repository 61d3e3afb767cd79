//! String interpolation for `{{ expr }}` and `$( cmd )`
//!
//! Both embedded forms are recognized anywhere a string appears in a step
//! definition or prompt. Expressions are substituted first, then shell
//! commands, so a command may itself be assembled from expression output.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Result;
use crate::expr::{self, VarResolver};
use crate::shell;

static EXPR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{(.*?)\}\}").unwrap());

/// Whether the text contains a `{{…}}` expression.
pub fn contains_expr(text: &str) -> bool {
    EXPR_RE.is_match(text)
}

/// Whether the text contains either embedded form.
pub fn is_dynamic(text: &str) -> bool {
    contains_expr(text) || find_command(text).is_some()
}

/// If the entire (trimmed) string is a single `$( … )`, return the command.
///
/// This is what distinguishes a shell *step* from a string that merely
/// embeds a command.
pub fn as_shell_command(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let (start, end) = find_command(trimmed)?;
    if start == 0 && end == trimmed.len() {
        Some(trimmed[start + 2..end - 1].trim())
    } else {
        None
    }
}

/// Find the first `$( … )` span, honoring nested parentheses.
/// Returns byte offsets of `$(` and one past the closing `)`.
fn find_command(text: &str) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'(' {
            let mut depth = 1;
            let mut j = i + 2;
            while j < bytes.len() {
                match bytes[j] {
                    b'(' => depth += 1,
                    b')' => {
                        depth -= 1;
                        if depth == 0 {
                            return Some((i, j + 1));
                        }
                    }
                    _ => {}
                }
                j += 1;
            }
            // Unbalanced; treat as literal text.
            return None;
        }
        i += 1;
    }
    None
}

/// Substitute `{{…}}` expressions in a string.
pub fn interpolate_exprs(text: &str, resolver: &dyn VarResolver) -> Result<String> {
    if !contains_expr(text) {
        return Ok(text.to_string());
    }

    let mut result = String::with_capacity(text.len());
    let mut last = 0;
    for captures in EXPR_RE.captures_iter(text) {
        let whole = captures.get(0).unwrap();
        let source = captures.get(1).unwrap().as_str().trim();
        result.push_str(&text[last..whole.start()]);
        let value = expr::evaluate(source, resolver)?;
        result.push_str(&expr::display_value(&value));
        last = whole.end();
    }
    result.push_str(&text[last..]);
    Ok(result)
}

/// Substitute `$(…)` commands in a string with their stdout.
///
/// With `exit_on_error`, a non-zero exit raises `ShellFailure`; otherwise
/// the stdout produced so far is substituted and the failure is carried by
/// the caller.
pub async fn interpolate_commands(text: &str, exit_on_error: bool) -> Result<String> {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some((start, end)) = find_command(rest) {
        result.push_str(&rest[..start]);
        let command = rest[start + 2..end - 1].trim();
        let output = if exit_on_error {
            shell::run_checked(command).await?
        } else {
            shell::run(command).await?
        };
        result.push_str(&output.stdout);
        rest = &rest[end..];
    }
    result.push_str(rest);
    Ok(result)
}

/// Full interpolation: expressions first, then shell commands.
pub async fn interpolate(
    text: &str,
    resolver: &dyn VarResolver,
    exit_on_error: bool,
) -> Result<String> {
    let expanded = interpolate_exprs(text, resolver)?;
    interpolate_commands(&expanded, exit_on_error).await
}

//! Target resolution
//!
//! A workflow's target names the external resource it operates on. String
//! forms cover a single path, a glob (one run per matched file), a
//! directory, a URL, or a `$(cmd)` yielding newline-separated paths; the
//! mapping form is a JSON fetch spec the engine resolves over HTTP.

use crate::config::{FetchSpec, TargetSpec};
use crate::error::{KilnError, Result};
use crate::expr::VarResolver;
use crate::interp;
use crate::shell;

/// A resolved target: either one run or one run per item.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedTarget {
    /// Single resource (path, directory, URL, fetched body)
    Single(String),
    /// Per-item runs (glob expansion, `$(cmd)` output lines)
    Many(Vec<String>),
}

impl ResolvedTarget {
    /// The per-run target values, in order.
    pub fn runs(&self) -> Vec<String> {
        match self {
            ResolvedTarget::Single(value) => vec![value.clone()],
            ResolvedTarget::Many(items) => items.clone(),
        }
    }
}

/// Resolve a target spec against the workflow scope.
pub async fn resolve(spec: &TargetSpec, resolver: &dyn VarResolver) -> Result<ResolvedTarget> {
    match spec {
        TargetSpec::Text(text) => resolve_text(text, resolver).await,
        TargetSpec::Fetch(fetch) => {
            let body = fetch_url(fetch).await?;
            Ok(ResolvedTarget::Single(body))
        }
    }
}

async fn resolve_text(text: &str, resolver: &dyn VarResolver) -> Result<ResolvedTarget> {
    let expanded = interp::interpolate_exprs(text.trim(), resolver)?;
    let trimmed = expanded.trim();

    // `$(cmd)` yields newline-separated paths, one run per line.
    if let Some(command) = interp::as_shell_command(trimmed) {
        let output = shell::run_checked(command).await?;
        let items = output.lines();
        if items.is_empty() {
            return Err(KilnError::Config(format!(
                "target command '{}' produced no paths",
                command
            )));
        }
        return Ok(ResolvedTarget::Many(items));
    }

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Ok(ResolvedTarget::Single(trimmed.to_string()));
    }

    if trimmed.contains(|c| c == '*' || c == '?' || c == '[') {
        let mut matches: Vec<String> = glob::glob(trimmed)
            .map_err(|e| KilnError::Config(format!("invalid target glob '{}': {}", trimmed, e)))?
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file())
            .map(|path| path.to_string_lossy().to_string())
            .collect();
        matches.sort();
        if matches.is_empty() {
            return Err(KilnError::Config(format!(
                "target glob '{}' matched no files",
                trimmed
            )));
        }
        return Ok(ResolvedTarget::Many(matches));
    }

    // A directory is a single resource; so is a plain path.
    Ok(ResolvedTarget::Single(trimmed.to_string()))
}

async fn fetch_url(spec: &FetchSpec) -> Result<String> {
    let client = reqwest::Client::new();
    let method: reqwest::Method = spec
        .options
        .method
        .as_deref()
        .unwrap_or("GET")
        .parse()
        .map_err(|_| {
            KilnError::Config(format!(
                "invalid target fetch method {:?}",
                spec.options.method
            ))
        })?;

    let mut request = client.request(method, &spec.url);
    if let Some(headers) = &spec.options.headers {
        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }
    }
    if let Some(body) = &spec.options.body {
        request = request.body(body.clone());
    }

    let response = request
        .send()
        .await
        .map_err(|e| KilnError::Config(format!("target fetch '{}' failed: {}", spec.url, e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(KilnError::Config(format!(
            "target fetch '{}' returned {}",
            spec.url, status
        )));
    }

    response
        .text()
        .await
        .map_err(|e| KilnError::Config(format!("target fetch '{}' body unreadable: {}", spec.url, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::MapResolver;
    use serde_json::json;

    #[tokio::test]
    async fn test_plain_path_target() {
        let resolver = MapResolver::new();
        let target = resolve(&TargetSpec::Text("src/main.rs".to_string()), &resolver)
            .await
            .unwrap();
        assert_eq!(target, ResolvedTarget::Single("src/main.rs".to_string()));
    }

    #[tokio::test]
    async fn test_url_target() {
        let resolver = MapResolver::new();
        let target = resolve(
            &TargetSpec::Text("https://example.com/data".to_string()),
            &resolver,
        )
        .await
        .unwrap();
        assert_eq!(
            target,
            ResolvedTarget::Single("https://example.com/data".to_string())
        );
    }

    #[tokio::test]
    async fn test_command_target_splits_lines() {
        let resolver = MapResolver::new();
        let target = resolve(
            &TargetSpec::Text("$(printf 'a.rs\\nb.rs\\n')".to_string()),
            &resolver,
        )
        .await
        .unwrap();
        assert_eq!(
            target,
            ResolvedTarget::Many(vec!["a.rs".to_string(), "b.rs".to_string()])
        );
        assert_eq!(target.runs().len(), 2);
    }

    #[tokio::test]
    async fn test_glob_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.txt"), "1").unwrap();
        std::fs::write(dir.path().join("two.txt"), "2").unwrap();
        std::fs::write(dir.path().join("skip.md"), "3").unwrap();

        let pattern = format!("{}/*.txt", dir.path().display());
        let resolver = MapResolver::new();
        let target = resolve(&TargetSpec::Text(pattern), &resolver).await.unwrap();

        match target {
            ResolvedTarget::Many(files) => {
                assert_eq!(files.len(), 2);
                assert!(files[0].ends_with("one.txt"));
                assert!(files[1].ends_with("two.txt"));
            }
            other => panic!("expected Many, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_glob_with_no_matches_errors() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/*.zig", dir.path().display());
        let resolver = MapResolver::new();
        assert!(resolve(&TargetSpec::Text(pattern), &resolver).await.is_err());
    }

    #[tokio::test]
    async fn test_target_interpolates_expressions() {
        let resolver = MapResolver::new().with("module", json!("core"));
        let target = resolve(&TargetSpec::Text("src/{{module}}.rs".to_string()), &resolver)
            .await
            .unwrap();
        assert_eq!(target, ResolvedTarget::Single("src/core.rs".to_string()));
    }
}

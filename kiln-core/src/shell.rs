//! Shell command execution for `$(…)` forms
//!
//! Commands run under `sh -c`; stdout is the value, the exit status is
//! recorded alongside. Callers decide whether a non-zero exit is fatal
//! (`exit_on_error`) or carried as data.

use tokio::process::Command;

use crate::error::{KilnError, Result};

/// Captured output of one shell command
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit status; -1 when terminated by a signal
    pub status: i32,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stdout split into trimmed, non-empty lines (the `each` iterable form).
    pub fn lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }
}

/// Run a shell command and capture its output.
///
/// This never fails on a non-zero exit; use [`run_checked`] for the
/// `exit_on_error` path.
pub async fn run(command: &str) -> Result<ShellOutput> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| KilnError::Other(format!("failed to spawn '{}': {}", command, e)))?;

    Ok(ShellOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        status: output.status.code().unwrap_or(-1),
    })
}

/// Run a shell command, raising `ShellFailure` on a non-zero exit.
pub async fn run_checked(command: &str) -> Result<ShellOutput> {
    let output = run(command).await?;
    if !output.success() {
        return Err(KilnError::ShellFailure {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }
    Ok(output)
}

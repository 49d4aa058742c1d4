// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subprocess execution for `shell` and `branch` steps.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info_span, Instrument};

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ShellOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Default)]
pub struct ShellRunner;

impl ShellRunner {
    /// Run `command` with `bash -c "set -euo pipefail\n<command>"`, the
    /// same wrapping discipline that makes a multi-line command abort
    /// on its first failing line.
    pub async fn run(
        &self,
        command: &str,
        cwd: Option<&PathBuf>,
        env: &HashMap<String, String>,
    ) -> Result<ShellOutcome, ShellError> {
        let span = info_span!("shell_exec");
        async move {
            let wrapped = format!("set -euo pipefail\n{command}");
            let mut cmd = Command::new("bash");
            cmd.arg("-c")
                .arg(wrapped)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            for (k, v) in env {
                cmd.env(k, v);
            }
            if let Some(cwd) = cwd {
                cmd.current_dir(cwd);
            }

            let mut child = cmd.spawn()?;
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let Some(mut out) = child.stdout.take() {
                out.read_to_string(&mut stdout).await?;
            }
            if let Some(mut err) = child.stderr.take() {
                err.read_to_string(&mut stderr).await?;
            }
            let status = child.wait().await?;

            Ok(ShellOutcome {
                exit_code: status.code().unwrap_or(-1),
                stdout,
                stderr,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let outcome = ShellRunner
            .run("echo hello", None, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_not_erred() {
        let outcome = ShellRunner
            .run("exit 7", None, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 7);
    }

    #[tokio::test]
    async fn set_euo_pipefail_aborts_on_first_failure() {
        let outcome = ShellRunner
            .run("false\necho should-not-print", None, &HashMap::new())
            .await
            .unwrap();
        assert_ne!(outcome.exit_code, 0);
        assert!(!outcome.stdout.contains("should-not-print"));
    }
}

//! Verification: runs a job's check and reports pass or fail with output.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Environment variable carrying the newline-separated list of changed files.
pub const CHANGED_FILES_ENV: &str = "PATCHFORGE_CHANGED_FILES";

/// Result of one verification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub passed: bool,
    /// Exit code, or `None` when the process was killed or timed out.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
    pub duration: Duration,
}

impl VerificationOutcome {
    pub fn pass(output: impl Into<String>) -> Self {
        Self {
            passed: true,
            exit_code: Some(0),
            output: output.into(),
            duration: Duration::ZERO,
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            exit_code: Some(1),
            output: output.into(),
            duration: Duration::ZERO,
        }
    }
}

/// The verifier could not run at all. Not the same as a failing check.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("Working directory does not exist: {}", .0.display())]
    InvalidWorkdir(PathBuf),

    #[error("Failed to spawn verification command: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Checks whether a job's working directory is in a passing state.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(
        &self,
        workdir: &Path,
        changed_files: &[String],
    ) -> Result<VerificationOutcome, VerificationError>;
}

/// Runs a shell command in the working directory; exit code 0 passes.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    command: String,
    timeout: Duration,
}

impl CommandVerifier {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    async fn verify(
        &self,
        workdir: &Path,
        changed_files: &[String],
    ) -> Result<VerificationOutcome, VerificationError> {
        if !workdir.is_dir() {
            return Err(VerificationError::InvalidWorkdir(workdir.to_path_buf()));
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(workdir)
            .env(CHANGED_FILES_ENV, changed_files.join("\n"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command = %self.command, workdir = %workdir.display(), "Running verification");
        let start = Instant::now();
        let child = cmd.spawn()?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => {
                let output = result?;
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                Ok(VerificationOutcome {
                    passed: output.status.success(),
                    exit_code: output.status.code(),
                    output: combined,
                    duration: start.elapsed(),
                })
            }
            Err(_) => {
                // Dropping the future drops the child, which kills it.
                warn!(
                    command = %self.command,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "Verification timed out"
                );
                Ok(VerificationOutcome {
                    passed: false,
                    exit_code: None,
                    output: format!(
                        "Error: verification command timed out after {:.1}s",
                        self.timeout.as_secs_f64()
                    ),
                    duration: start.elapsed(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passing_command() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = CommandVerifier::new("echo ok", Duration::from_secs(10));
        let outcome = verifier.verify(dir.path(), &[]).await.unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.output.trim(), "ok");
    }

    #[tokio::test]
    async fn test_failing_command_captures_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = CommandVerifier::new(
            "echo \"Error: Cannot find module 'left-pad'\" >&2; exit 2",
            Duration::from_secs(10),
        );
        let outcome = verifier.verify(dir.path(), &[]).await.unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.exit_code, Some(2));
        assert!(outcome.output.contains("left-pad"));
    }

    #[tokio::test]
    async fn test_runs_in_workdir_with_changed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let verifier = CommandVerifier::new(
            "test -f marker.txt && echo \"$PATCHFORGE_CHANGED_FILES\"",
            Duration::from_secs(10),
        );
        let changed = vec!["a.js".to_string(), "b.js".to_string()];
        let outcome = verifier.verify(dir.path(), &changed).await.unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.output.trim(), "a.js\nb.js");
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = CommandVerifier::new("sleep 5", Duration::from_millis(200));
        let outcome = verifier.verify(dir.path(), &[]).await.unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.output.contains("timed out"));
        assert!(outcome.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_workdir() {
        let verifier = CommandVerifier::new("true", Duration::from_secs(1));
        let err = verifier
            .verify(Path::new("/nonexistent/patchforge/dir"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::InvalidWorkdir(_)));
    }
}

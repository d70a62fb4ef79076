//! Reasoning engine run as a subprocess.
//!
//! The request is written to the command's stdin as JSON; the decision is
//! read from stdout. Exit code 75 (EX_TEMPFAIL) signals an exhausted quota.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{parse_decision, Reasoner, ReasoningFailure, ReasoningRequest};
use crate::domain::Decision;

/// Exit code a command uses to report quota exhaustion
pub const EXIT_QUOTA_EXCEEDED: i32 = 75;

/// Reasoner backed by an external command
pub struct CommandReasoner {
    /// Program to run
    program: String,
    /// Arguments passed to the program
    args: Vec<String>,
    /// Hard limit on one invocation
    call_timeout: Duration,
}

impl CommandReasoner {
    pub fn new(program: impl Into<String>, args: Vec<String>, call_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            call_timeout,
        }
    }

    /// Build from a whitespace-separated command line
    pub fn from_command_line(command_line: &str, call_timeout: Duration) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect(), call_timeout))
    }

    async fn run(&self, input: &[u8]) -> Result<String, ReasoningFailure> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ReasoningFailure::MalformedOutput(format!(
                    "failed to spawn reasoner '{}': {}",
                    self.program, e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that exits without reading its input is judged by its exit code
            if let Err(e) = stdin.write_all(input).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(ReasoningFailure::MalformedOutput(format!(
                        "failed to write reasoner stdin: {}",
                        e
                    )));
                }
            }
        }

        let output = timeout(self.call_timeout, child.wait_with_output())
            .await
            .map_err(|_| ReasoningFailure::Timeout(self.call_timeout))?
            .map_err(|e| {
                ReasoningFailure::MalformedOutput(format!("failed to wait for reasoner: {}", e))
            })?;

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            if exit_code == EXIT_QUOTA_EXCEEDED {
                return Err(ReasoningFailure::QuotaExceeded);
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReasoningFailure::MalformedOutput(format!(
                "reasoner exited with code {}: {}",
                exit_code,
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|_| ReasoningFailure::MalformedOutput("output is not valid UTF-8".to_string()))
    }
}

#[async_trait]
impl Reasoner for CommandReasoner {
    fn name(&self) -> &str {
        &self.program
    }

    async fn infer(&self, request: &ReasoningRequest) -> Result<Decision, ReasoningFailure> {
        let input = serde_json::to_vec(request)
            .map_err(|e| ReasoningFailure::MalformedOutput(format!("failed to encode request: {}", e)))?;

        let stdout = self.run(&input).await?;
        debug!(program = %self.program, bytes = stdout.len(), "Reasoner responded");
        parse_decision(&stdout)
    }
}

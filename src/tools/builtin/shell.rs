//! Shell execution tool.
//!
//! Runs commands in the job's working directory with a timeout, captured
//! output, and a small deny-list of destructive patterns.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::ToolError;
use crate::tools::tool::{Tool, require_str};

/// Maximum captured output before truncation.
const MAX_OUTPUT: usize = 32 * 1024;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Patterns that are never executed, regardless of context.
const BLOCKED_PATTERNS: &[&str] = &[
    "rm -rf /",
    "mkfs",
    "dd if=/dev/zero",
    ":(){ :|:& };:",
    "> /dev/sda",
    "| sh",
    "| bash",
    "sudo ",
];

#[derive(Debug, Default)]
pub struct ShellTool;

impl ShellTool {
    pub fn new() -> Self {
        Self
    }

    fn blocked(cmd: &str) -> bool {
        let normalized = cmd.to_lowercase();
        BLOCKED_PATTERNS.iter().any(|p| normalized.contains(p))
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the job workspace. Use for builds, tests, \
         git operations, and file inspection. Output is captured and truncated."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (optional, default 120)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        workdir: &Path,
    ) -> Result<String, ToolError> {
        let command = require_str(&params, "shell", "command")?;
        let timeout = params
            .get("timeout")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        if Self::blocked(command) {
            return Err(ToolError::ExecutionFailed {
                name: "shell".to_string(),
                reason: "command contains a blocked pattern".to_string(),
            });
        }

        let output = tokio::time::timeout(
            timeout,
            Command::new("sh")
                .args(["-c", command])
                .current_dir(workdir)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| ToolError::Timeout {
            name: "shell".to_string(),
            timeout,
        })?
        .map_err(|e| ToolError::ExecutionFailed {
            name: "shell".to_string(),
            reason: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stderr.is_empty() {
            stdout.to_string()
        } else if stdout.is_empty() {
            stderr.to_string()
        } else {
            format!("{stdout}\n--- stderr ---\n{stderr}")
        };

        let result = serde_json::json!({
            "output": truncate(&combined),
            "exit_code": output.status.code().unwrap_or(-1),
        });
        Ok(result.to_string())
    }
}

/// Truncate at a char boundary, keeping the head.
fn truncate(s: &str) -> String {
    if s.len() <= MAX_OUTPUT {
        return s.to_string();
    }
    let mut end = MAX_OUTPUT;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... [truncated {} bytes]", &s[..end], s.len() - end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_command_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("marker.txt"), "x")
            .await
            .unwrap();

        let out = ShellTool::new()
            .execute(serde_json::json!({"command": "ls"}), dir.path())
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert!(value["output"].as_str().unwrap().contains("marker.txt"));
        assert_eq!(value["exit_code"], 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_an_error() {
        let out = ShellTool::new()
            .execute(serde_json::json!({"command": "exit 7"}), Path::new("/tmp"))
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["exit_code"], 7);
    }

    #[tokio::test]
    async fn blocked_patterns_are_rejected() {
        let err = ShellTool::new()
            .execute(
                serde_json::json!({"command": "sudo rm -rf / --no-preserve-root"}),
                Path::new("/tmp"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));
    }

    #[tokio::test]
    async fn times_out() {
        let err = ShellTool::new()
            .execute(
                serde_json::json!({"command": "sleep 10", "timeout": 1}),
                Path::new("/tmp"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[test]
    fn truncate_long_output() {
        let long = "z".repeat(MAX_OUTPUT + 100);
        let out = truncate(&long);
        assert!(out.contains("[truncated"));
        assert!(out.len() < long.len());
    }
}

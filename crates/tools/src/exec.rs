//! The shell execution tool: run a command to completion and capture output.
//!
//! Foreground-only; the engine's retry/timeout semantics live in
//! [`crate::contract::invoke_safely`], not here.

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use ag_domain::{Error, Result};
use async_trait::async_trait;

use crate::contract::{Tool, ToolResult};

/// Environment variable names a command is never allowed to override.
fn is_dangerous_env_var(name: &str) -> bool {
    const BLOCKED: &[&str] = &[
        "LD_PRELOAD", "LD_LIBRARY_PATH", "LD_AUDIT",
        "DYLD_INSERT_LIBRARIES", "DYLD_LIBRARY_PATH", "DYLD_FRAMEWORK_PATH",
        "PATH", "HOME", "USER", "SHELL",
        "SSH_AUTH_SOCK", "SSH_AGENT_PID",
        "PYTHONPATH", "PYTHONSTARTUP", "PYTHONHOME",
        "NODE_PATH", "NODE_OPTIONS",
        "RUBYLIB", "RUBYOPT",
        "PERL5LIB", "PERL5OPT",
        "CLASSPATH",
        "BASH_ENV", "ENV", "CDPATH",
        "IFS",
    ];
    let upper = name.to_ascii_uppercase();
    BLOCKED.contains(&upper.as_str())
}

#[derive(Debug, Clone, Deserialize)]
struct ExecParams {
    command: String,
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default)]
    env: std::collections::HashMap<String, String>,
}

pub struct ExecTool {
    timeout: std::time::Duration,
}

impl ExecTool {
    pub fn new(timeout: std::time::Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Run a shell command to completion and return its combined stdout/stderr."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["command"],
            "properties": {
                "command": {"type": "string"},
                "workdir": {"type": "string"},
                "env": {"type": "object", "additionalProperties": {"type": "string"}},
            },
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolResult> {
        let params: ExecParams = serde_json::from_value(params)?;

        for key in params.env.keys() {
            if is_dangerous_env_var(key) {
                return Ok(ToolResult::failure(format!(
                    "environment variable '{key}' is blocked by security policy"
                )));
            }
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&params.command);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::null());
        if let Some(ref workdir) = params.workdir {
            cmd.current_dir(workdir);
        }
        for (k, v) in &params.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| Error::ToolExecution {
            tool: self.name().to_string(),
            message: format!("failed to spawn: {e}"),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_task = tokio::spawn(async move {
            let mut out = String::new();
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    out.push_str(&line);
                    out.push('\n');
                }
            }
            out
        });
        let stderr_task = tokio::spawn(async move {
            let mut out = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    out.push_str(&line);
                    out.push('\n');
                }
            }
            out
        });

        let wait = tokio::time::timeout(self.timeout, child.wait()).await;
        let stdout_text = stdout_task.await.unwrap_or_default();
        let stderr_text = stderr_task.await.unwrap_or_default();

        let status = match wait {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(Error::ToolExecution {
                    tool: self.name().to_string(),
                    message: format!("wait failed: {e}"),
                })
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(Error::Timeout(self.timeout));
            }
        };

        let combined = format!("{stdout_text}{stderr_text}");
        if status.success() {
            Ok(ToolResult::ok(json!({
                "exit_code": status.code(),
                "output": combined,
            })))
        } else {
            Ok(ToolResult {
                success: false,
                payload: json!({"exit_code": status.code(), "output": combined}),
                error: Some(format!("command exited with status {status}")),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> ExecTool {
        ExecTool::new(std::time::Duration::from_secs(5))
    }

    #[tokio::test]
    async fn runs_a_command_and_captures_stdout() {
        let result = tool()
            .execute(json!({"command": "echo hello"}))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.payload["output"].as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_as_failure_not_an_error() {
        let result = tool().execute(json!({"command": "exit 7"})).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.payload["exit_code"], 7);
    }

    #[tokio::test]
    async fn blocked_env_var_is_rejected_before_spawn() {
        let result = tool()
            .execute(json!({"command": "echo hi", "env": {"LD_PRELOAD": "/evil.so"}}))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("blocked"));
    }

    #[tokio::test]
    async fn timeout_kills_a_long_running_command() {
        let short = ExecTool::new(std::time::Duration::from_millis(50));
        let err = short.execute(json!({"command": "sleep 5"})).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use turnloop_shell::{AllowAllCommands, Shell};

use crate::tool::{Tool, ToolOutput};

const MAX_OUTPUT_CHARS: usize = 20_000;
const HEAD_LINES: usize = 100;
const TAIL_LINES: usize = 100;

/// Runs shell commands against a single persistent shell shared across every
/// call, preserving working directory and environment between invocations.
pub struct RunCommandTool {
    pub shell: std::sync::Arc<Shell>,
    pub timeout_secs: u64,
}

impl RunCommandTool {
    pub fn new(shell: std::sync::Arc<Shell>, timeout_secs: u64) -> Self {
        Self { shell, timeout_secs }
    }
}

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Executes a shell command in a persistent session. Working directory and \
         environment variables carry over between calls. The session cannot \
         escape the directory it was opened in; attempts to `cd` outside of it \
         are reset automatically.\n\n\
         ## Usage\n\
         - Run build/test commands, inspect files with coreutils, chain commands with `&&`\n\
         - Long-running or interactive commands should be avoided; a default timeout applies\n\n\
         ## IMPORTANT\n\
         - Output beyond 20,000 characters is truncated to its first and last 100 lines"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to run"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Override the default per-command timeout, in seconds"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call_id: &str, args: &Value) -> ToolOutput {
        let command = match args.get("command").and_then(|v| v.as_str()) {
            Some(c) if !c.is_empty() => c,
            _ => return ToolOutput::err(call_id, "missing 'command'"),
        };
        let timeout = args
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(self.timeout_secs));

        debug!(command = %command, "run_command tool");

        let token = CancellationToken::new();
        match self.shell.execute(command, timeout, &token, &AllowAllCommands).await {
            Ok(result) => {
                let mut output = head_tail_truncate(&result.output, MAX_OUTPUT_CHARS, HEAD_LINES, TAIL_LINES);
                if !result.error.is_empty() {
                    output.push_str("\n--- stderr ---\n");
                    output.push_str(&head_tail_truncate(&result.error, MAX_OUTPUT_CHARS, HEAD_LINES, TAIL_LINES));
                }
                output.push_str(&format!("\n[exit code: {}]", result.exit_code));
                if result.exit_code == 0 {
                    ToolOutput::ok(call_id, output)
                } else {
                    ToolOutput::err(call_id, output)
                }
            }
            Err(e) => ToolOutput::err(call_id, format!("shell error: {e}")),
        }
    }
}

/// Keep the first `head` and last `tail` lines when `text` exceeds
/// `max_chars`, noting how many lines were dropped in between.
fn head_tail_truncate(text: &str, max_chars: usize, head: usize, tail: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= head + tail {
        return text.to_string();
    }
    let head_part = lines[..head].join("\n");
    let tail_part = lines[lines.len() - tail..].join("\n");
    let omitted = lines.len() - head - tail;
    format!("{head_part}\n... [{omitted} lines omitted] ...\n{tail_part}")
}

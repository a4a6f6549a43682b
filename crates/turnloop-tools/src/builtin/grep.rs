// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolOutput};

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Pattern search over files, backed by ripgrep when available and\n\
         falling back to the system `grep` otherwise.\n\
         pattern: full regex (escape literal braces: \\{\\}). include: glob filter (*.rs, **/*.{ts,tsx}).\n\
         case_sensitive: true by default. limit: 100 by default.\n\
         output_mode: content (default, shows file:line:col:text) | files_with_matches | count\n\
         context_lines: lines of context before+after each match (default 0)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression pattern to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search in (default: current directory)"
                },
                "include": {
                    "type": "string",
                    "description": "Glob pattern to filter files, e.g. '*.rs' or '*.{ts,tsx}'"
                },
                "case_sensitive": {
                    "type": "boolean",
                    "description": "Case-sensitive search (default true)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of matches to return (default 100)"
                },
                "output_mode": {
                    "type": "string",
                    "enum": ["content", "files_with_matches", "count"],
                    "description": "Output format: content (default), files_with_matches, or count"
                },
                "context_lines": {
                    "type": "integer",
                    "description": "Lines of context before and after each match (default 0)"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call_id: &str, args: &Value) -> ToolOutput {
        let pattern = match args.get("pattern").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(call_id, "missing required parameter 'pattern'"),
        };
        let search = Search {
            pattern,
            path: args.get("path").and_then(|v| v.as_str()).unwrap_or(".").to_string(),
            include: args.get("include").and_then(|v| v.as_str()).map(str::to_string),
            case_sensitive: args.get("case_sensitive").and_then(|v| v.as_bool()).unwrap_or(true),
            limit: args.get("limit").and_then(|v| v.as_u64()).unwrap_or(100) as usize,
            mode: OutputMode::parse(args.get("output_mode").and_then(|v| v.as_str()).unwrap_or("content")),
            context_lines: args.get("context_lines").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
        };

        debug!(pattern = %search.pattern, path = %search.path, mode = ?search.mode, "grep tool");

        match search.run().await {
            Ok(output) if output.trim().is_empty() => ToolOutput::ok(call_id, "no matches"),
            Ok(output) => ToolOutput::ok(call_id, output),
            Err(e) => ToolOutput::err(call_id, format!("grep error: {e}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Content,
    FilesWithMatches,
    Count,
}

impl OutputMode {
    fn parse(s: &str) -> Self {
        match s {
            "files_with_matches" => Self::FilesWithMatches,
            "count" => Self::Count,
            _ => Self::Content,
        }
    }
}

struct Search {
    pattern: String,
    path: String,
    include: Option<String>,
    case_sensitive: bool,
    limit: usize,
    mode: OutputMode,
    context_lines: usize,
}

impl Search {
    async fn run(&self) -> anyhow::Result<String> {
        let raw = if rg_is_available().await {
            self.spawn("rg", self.ripgrep_args()).await?
        } else {
            self.spawn("grep", self.grep_args()).await?
        };
        Ok(self.cap_lines(&String::from_utf8_lossy(&raw.stdout)))
    }

    async fn spawn(&self, program: &str, args: Vec<String>) -> std::io::Result<std::process::Output> {
        tokio::process::Command::new(program).args(&args).stdin(std::process::Stdio::null()).output().await
    }

    fn ripgrep_args(&self) -> Vec<String> {
        let mut args = vec!["--color".to_string(), "never".to_string()];
        match self.mode {
            OutputMode::FilesWithMatches => args.push("-l".to_string()),
            OutputMode::Count => args.push("-c".to_string()),
            OutputMode::Content => {
                // vimgrep format gives unambiguous file:line:col:text output
                args.push("--vimgrep".to_string());
                args.push("--no-heading".to_string());
            }
        }
        if !self.case_sensitive {
            args.push("--ignore-case".to_string());
        }
        if self.context_lines > 0 && self.mode == OutputMode::Content {
            args.push(format!("-C{}", self.context_lines));
        }
        if let Some(glob) = &self.include {
            args.push("-g".to_string());
            args.push(glob.clone());
        }
        args.push(self.pattern.clone());
        args.push(self.path.clone());
        args
    }

    fn grep_args(&self) -> Vec<String> {
        let mut args = vec!["-rn".to_string()];
        match self.mode {
            OutputMode::FilesWithMatches => args.push("-l".to_string()),
            OutputMode::Count => args.push("-c".to_string()),
            OutputMode::Content => {}
        }
        if !self.case_sensitive {
            args.push("-i".to_string());
        }
        if self.context_lines > 0 && self.mode == OutputMode::Content {
            args.push(format!("-C{}", self.context_lines));
        }
        if let Some(glob) = &self.include {
            args.push("--include".to_string());
            args.push(glob.clone());
        }
        args.push(self.pattern.clone());
        args.push(self.path.clone());
        args
    }

    fn cap_lines(&self, raw: &str) -> String {
        let all: Vec<&str> = raw.lines().collect();
        if all.len() <= self.limit {
            return all.join("\n");
        }
        let mut capped = all[..self.limit].join("\n");
        capped.push_str(&format!("\n...[{} more matches hidden — narrow with path= or include=]", all.len() - self.limit));
        capped
    }
}

async fn rg_is_available() -> bool {
    tokio::process::Command::new("which")
        .arg("rg")
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolOutput};

pub struct ApplyPatchTool;

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str {
        "apply_patch"
    }

    fn description(&self) -> &str {
        "Apply a patch to add, update, or delete files.\n\
         Format:\n\
         *** Begin Patch\n\
         *** Add File: path/to/new_file.rs\n\
         +content line 1\n\
         +content line 2\n\
         *** Delete File: path/to/old_file.rs\n\
         *** Update File: path/to/existing.rs\n\
         @@ context_line_1\n\
          context line (space prefix)\n\
         -removed line\n\
         +added line\n\
          context line\n\
         *** End Patch\n\
         Returns one summary line per file touched."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "input": {
                    "type": "string",
                    "description": "The full patch text including *** Begin Patch and *** End Patch markers"
                }
            },
            "required": ["input"]
        })
    }

    async fn execute(&self, call_id: &str, args: &Value) -> ToolOutput {
        let input = match args.get("input").and_then(|v| v.as_str()) {
            Some(s) => s,
            None => return ToolOutput::err(call_id, "missing 'input'"),
        };

        debug!("apply_patch tool");

        match apply(input).await {
            Ok(summary) => ToolOutput::ok(call_id, summary),
            Err(e) => ToolOutput::err(call_id, format!("patch error: {e}")),
        }
    }
}

const BEGIN_MARKER: &str = "*** Begin Patch";
const END_MARKER: &str = "*** End Patch";

enum FileOp {
    Add { path: String, content: String },
    Delete { path: String },
    Update { path: String, hunks: Vec<Hunk> },
}

/// A single `@@`-delimited hunk: an optional one-line anchor (the text after
/// `@@`) plus its body lines, each tagged ' ' (context), '-' (remove), or
/// '+' (add).
struct Hunk {
    anchor: Option<String>,
    body: Vec<(char, String)>,
}

async fn apply(input: &str) -> anyhow::Result<String> {
    let start = input.find(BEGIN_MARKER).ok_or_else(|| anyhow::anyhow!("'{BEGIN_MARKER}' not found"))?;
    let end = input.find(END_MARKER).ok_or_else(|| anyhow::anyhow!("'{END_MARKER}' not found"))?;
    if end <= start {
        anyhow::bail!("'{END_MARKER}' appears before '{BEGIN_MARKER}'");
    }
    let body = &input[start + BEGIN_MARKER.len()..end];

    let ops = parse_ops(body)?;
    if ops.is_empty() {
        return Ok("(no changes applied)".to_string());
    }

    let mut summary = Vec::with_capacity(ops.len());
    for op in ops {
        summary.push(apply_op(op).await?);
    }
    Ok(summary.join("\n"))
}

fn parse_ops(body: &str) -> anyhow::Result<Vec<FileOp>> {
    let mut lines = body.lines().peekable();
    let mut ops = Vec::new();

    while let Some(line) = lines.next() {
        if let Some(path) = line.strip_prefix("*** Add File: ") {
            let mut content_lines = Vec::new();
            while let Some(next) = lines.peek() {
                if next.starts_with("*** ") {
                    break;
                }
                content_lines.push(next.strip_prefix('+').unwrap_or(next).to_string());
                lines.next();
            }
            let mut content = content_lines.join("\n");
            if !content.ends_with('\n') {
                content.push('\n');
            }
            ops.push(FileOp::Add { path: path.trim().to_string(), content });
        } else if let Some(path) = line.strip_prefix("*** Delete File: ") {
            ops.push(FileOp::Delete { path: path.trim().to_string() });
        } else if let Some(path) = line.strip_prefix("*** Update File: ") {
            let hunks = parse_hunks(&mut lines);
            ops.push(FileOp::Update { path: path.trim().to_string(), hunks });
        }
        // any other line (blank lines between ops, stray text) is ignored
    }

    Ok(ops)
}

fn parse_hunks<'a>(lines: &mut std::iter::Peekable<std::str::Lines<'a>>) -> Vec<Hunk> {
    let mut hunks = Vec::new();
    while let Some(&line) = lines.peek() {
        if line.starts_with("*** ") {
            break;
        }
        if let Some(anchor) = line.strip_prefix("@@ ") {
            lines.next();
            let anchor = anchor.trim();
            let mut body = Vec::new();
            while let Some(&next) = lines.peek() {
                if next.starts_with("@@ ") || next.starts_with("*** ") {
                    break;
                }
                lines.next();
                if let Some(rest) = next.strip_prefix('+') {
                    body.push(('+', rest.to_string()));
                } else if let Some(rest) = next.strip_prefix('-') {
                    body.push(('-', rest.to_string()));
                } else if let Some(rest) = next.strip_prefix(' ') {
                    body.push((' ', rest.to_string()));
                }
            }
            hunks.push(Hunk { anchor: (!anchor.is_empty()).then(|| anchor.to_string()), body });
        } else {
            lines.next();
        }
    }
    hunks
}

async fn apply_op(op: FileOp) -> anyhow::Result<String> {
    match op {
        FileOp::Add { path, content } => {
            if let Some(parent) = std::path::Path::new(&path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            tokio::fs::write(&path, &content).await?;
            Ok(format!("A {path}"))
        }
        FileOp::Delete { path } => {
            if tokio::fs::metadata(&path).await.is_ok() {
                tokio::fs::remove_file(&path).await?;
            }
            Ok(format!("D {path}"))
        }
        FileOp::Update { path, hunks } => {
            let original = tokio::fs::read_to_string(&path).await.map_err(|e| anyhow::anyhow!("cannot read {path}: {e}"))?;
            let updated = apply_hunks(&original, &hunks).map_err(|e| anyhow::anyhow!("hunk failed for {path}: {e}"))?;
            tokio::fs::write(&path, &updated).await?;
            Ok(format!("M {path}"))
        }
    }
}

fn apply_hunks(content: &str, hunks: &[Hunk]) -> anyhow::Result<String> {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let had_trailing_newline = content.ends_with('\n');

    for hunk in hunks {
        let expected: Vec<&str> = hunk.body.iter().filter(|(tag, _)| *tag == '-' || *tag == ' ').map(|(_, l)| l.as_str()).collect();
        let start = locate_hunk(&lines, hunk.anchor.as_deref(), &expected).ok_or_else(|| anyhow::anyhow!("could not find hunk context in file"))?;

        let mut replacement = Vec::new();
        let mut cursor = start;
        for (tag, text) in &hunk.body {
            match tag {
                ' ' => {
                    replacement.push(text.clone());
                    cursor += 1;
                }
                '-' => cursor += 1,
                '+' => replacement.push(text.clone()),
                _ => {}
            }
        }
        lines.splice(start..cursor, replacement);
    }

    let mut result = lines.join("\n");
    if had_trailing_newline {
        result.push('\n');
    }
    Ok(result)
}

/// Finds where `expected` (the hunk's unchanged-plus-removed lines) occurs in
/// `lines`, preferring the first occurrence of `anchor` as a starting point
/// when one was given, and falling back to a bare scan for `expected`
/// otherwise.
fn locate_hunk(lines: &[String], anchor: Option<&str>, expected: &[&str]) -> Option<usize> {
    if let Some(anchor) = anchor {
        return lines.iter().position(|l| l.trim() == anchor.trim()).filter(|&i| matches_at(lines, i, expected));
    }
    (0..=lines.len().saturating_sub(expected.len())).find(|&i| matches_at(lines, i, expected))
}

fn matches_at(lines: &[String], start: usize, expected: &[&str]) -> bool {
    if start + expected.len() > lines.len() {
        return false;
    }
    expected.iter().enumerate().all(|(i, exp)| lines[start + i].trim() == exp.trim())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tmp_path(suffix: &str) -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CTR: AtomicU32 = AtomicU32::new(0);
        let n = CTR.fetch_add(1, Ordering::Relaxed);
        format!("/tmp/turnloop_patch_test_{}_{n}{suffix}", std::process::id())
    }

    #[tokio::test]
    async fn add_new_file() {
        let path = tmp_path(".txt");
        let patch = format!("*** Begin Patch\n*** Add File: {path}\n+hello\n+world\n*** End Patch\n");
        let out = ApplyPatchTool.execute("ap1", &json!({"input": patch})).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains(&format!("A {path}")));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("hello"));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn delete_file() {
        let path = tmp_path("_del.txt");
        std::fs::write(&path, "bye").unwrap();
        let patch = format!("*** Begin Patch\n*** Delete File: {path}\n*** End Patch\n");
        let out = ApplyPatchTool.execute("ap1", &json!({"input": patch})).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains(&format!("D {path}")));
        assert!(!std::path::Path::new(&path).exists());
    }

    #[tokio::test]
    async fn update_file_with_hunk() {
        let path = tmp_path("_upd.txt");
        std::fs::write(&path, "line1\nline2\nline3\n").unwrap();
        let patch = format!("*** Begin Patch\n*** Update File: {path}\n@@ line1\n line1\n-line2\n+line2_updated\n line3\n*** End Patch\n");
        let out = ApplyPatchTool.execute("ap1", &json!({"input": patch})).await;
        assert!(!out.is_error, "{}", out.content);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("line2_updated"));
        assert!(!content.contains("\nline2\n"));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn multiple_operations_in_one_patch_are_all_applied() {
        let add_path = tmp_path("_multi_add.txt");
        let del_path = tmp_path("_multi_del.txt");
        std::fs::write(&del_path, "gone").unwrap();
        let patch = format!("*** Begin Patch\n*** Add File: {add_path}\n+new content\n*** Delete File: {del_path}\n*** End Patch\n");
        let out = ApplyPatchTool.execute("ap1", &json!({"input": patch})).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains(&format!("A {add_path}")));
        assert!(out.content.contains(&format!("D {del_path}")));
        let _ = std::fs::remove_file(&add_path);
    }

    #[tokio::test]
    async fn missing_input_is_error() {
        let out = ApplyPatchTool.execute("ap1", &json!({})).await;
        assert!(out.is_error);
        assert!(out.content.contains("missing 'input'"));
    }

    #[tokio::test]
    async fn missing_begin_marker_is_error() {
        let out = ApplyPatchTool.execute("ap1", &json!({"input": "no markers here"})).await;
        assert!(out.is_error);
        assert!(out.content.contains("not found"));
    }
}

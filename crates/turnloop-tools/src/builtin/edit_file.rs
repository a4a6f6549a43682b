// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use similar::{ChangeTag, TextDiff};
use tracing::debug;

use crate::tool::{Tool, ToolOutput};

/// Minimum combined similarity (0-1) for a fuzzy window to stand in for an
/// exact context match.
const FUZZY_THRESHOLD: f64 = 0.85;

// ── Patch representation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Context,
    Remove,
    Insert,
}

#[derive(Debug, Clone)]
struct EditLine {
    tag: Tag,
    text: String,
}

#[derive(Debug, Clone, Default)]
struct EditHunk {
    /// 1-based old-file line from `@@ -N,...`; a tie-breaking hint only.
    anchor_hint: Option<usize>,
    lines: Vec<EditLine>,
}

impl EditHunk {
    /// Context + Remove lines, in order — the text that must already be
    /// present in the file for this hunk to apply.
    fn needle(&self) -> Vec<&str> {
        self.lines.iter().filter(|l| l.tag != Tag::Insert).map(|l| l.text.as_str()).collect()
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────────

fn strip_fence(diff: &str) -> &str {
    let trimmed = diff.trim_start();
    let Some(after_open) = trimmed.strip_prefix("```") else {
        return diff;
    };
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    match body.rfind("\n```") {
        Some(close) => &body[..close + 1],
        None => body,
    }
}

/// Parses `@@`-delimited hunks out of `diff`. Headers may carry
/// `-old,+new` line numbers, a trailing section-name comment, or be fully
/// bare (`@@ @@`) — numbers are never required, only used to break ties
/// between equally-good matches later on.
fn parse_hunks(diff: &str) -> Result<Vec<EditHunk>, String> {
    let diff = strip_fence(diff);
    let mut hunks = Vec::new();
    let mut building: Option<EditHunk> = None;

    let flush = |building: &mut Option<EditHunk>, hunks: &mut Vec<EditHunk>| {
        if let Some(h) = building.take() {
            if !h.lines.is_empty() {
                hunks.push(h);
            }
        }
    };

    for line in diff.lines() {
        if line.starts_with("--- ") || line.starts_with("+++ ") || line.starts_with("\\ ") {
            continue;
        }
        if line.starts_with("@@") {
            flush(&mut building, &mut hunks);
            building = Some(EditHunk { anchor_hint: extract_anchor_hint(line), lines: Vec::new() });
            continue;
        }
        let Some(hunk) = building.as_mut() else { continue };
        let tagged = line.strip_prefix(' ').map(|r| (Tag::Context, r)).or_else(|| line.strip_prefix('-').map(|r| (Tag::Remove, r))).or_else(|| line.strip_prefix('+').map(|r| (Tag::Insert, r)));
        match tagged {
            Some((tag, rest)) => hunk.lines.push(EditLine { tag, text: rest.to_string() }),
            None if line.is_empty() => hunk.lines.push(EditLine { tag: Tag::Context, text: String::new() }),
            None => {}
        }
    }
    flush(&mut building, &mut hunks);

    if hunks.is_empty() {
        return Err("No hunks found in diff — each hunk must start with @@".to_string());
    }
    Ok(hunks)
}

/// Pulls the old-file start line out of `@@ -N[,M] +N[,M] @@ [section]`.
fn extract_anchor_hint(header: &str) -> Option<usize> {
    let inner = header.trim_start_matches('@').split("@@").next()?.trim();
    inner.split_whitespace().find_map(|field| field.strip_prefix('-')?.split(',').next()?.parse().ok())
}

// ── Locating the patch target ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Placement {
    start: usize,
    /// Spaces to add (positive) or drop (negative) from inserted lines,
    /// when the match was only found after normalizing indentation.
    indent_shift: i64,
}

/// Locates where `needle` sits inside `haystack`, trying progressively looser
/// strategies until one succeeds: exact text, then indentation-normalized,
/// then fuzzy (character-similarity) matching. Ties among equally good
/// candidates are broken by `hint`, the hunk's `@@ -N` line number.
fn locate(haystack: &[String], needle: &[&str], hint: Option<usize>) -> Result<Placement, String> {
    if needle.is_empty() {
        let start = hint.map(|h| h.saturating_sub(1).min(haystack.len())).unwrap_or(haystack.len());
        return Ok(Placement { start, indent_shift: 0 });
    }

    let refs: Vec<&str> = haystack.iter().map(String::as_str).collect();
    if refs.len() < needle.len() {
        return Err(format!("file has {} lines, hunk needs {}", refs.len(), needle.len()));
    }

    for finder in [find_exact, find_indent_normalized, find_fuzzy] {
        if let Some(placement) = finder(&refs, needle, hint) {
            return Ok(placement);
        }
    }
    Err(describe_miss(&refs, needle))
}

fn windows<'a>(haystack: &'a [&'a str], len: usize) -> impl Iterator<Item = (usize, &'a [&'a str])> {
    (0..=haystack.len() - len).map(move |i| (i, &haystack[i..i + len]))
}

fn find_exact(haystack: &[&str], needle: &[&str], hint: Option<usize>) -> Option<Placement> {
    let hits: Vec<usize> = windows(haystack, needle.len()).filter(|(_, win)| *win == needle).map(|(i, _)| i).collect();
    (!hits.is_empty()).then(|| Placement { start: resolve_tie(&hits, hint), indent_shift: 0 })
}

fn find_indent_normalized(haystack: &[&str], needle: &[&str], hint: Option<usize>) -> Option<Placement> {
    let needle_indent = indent_of(needle) as i64;
    let normalized_needle = dedent(needle, needle_indent as usize);

    let hits: Vec<(usize, i64)> = windows(haystack, needle.len())
        .filter_map(|(i, win)| {
            let win_indent = indent_of(win) as i64;
            (dedent(win, win_indent as usize) == normalized_needle).then_some((i, win_indent - needle_indent))
        })
        .collect();
    if hits.is_empty() {
        return None;
    }
    let positions: Vec<usize> = hits.iter().map(|&(i, _)| i).collect();
    let start = resolve_tie(&positions, hint);
    let indent_shift = hits.iter().find(|&&(i, _)| i == start).map(|&(_, d)| d).unwrap_or(0);
    Some(Placement { start, indent_shift })
}

fn find_fuzzy(haystack: &[&str], needle: &[&str], hint: Option<usize>) -> Option<Placement> {
    let needle_text = needle.join("\n");
    let needle_indent = indent_of(needle) as i64;

    let mut scored: Vec<(f64, usize, i64)> = windows(haystack, needle.len())
        .filter_map(|(i, win)| {
            let ratio = char_similarity(&needle_text, &win.join("\n"));
            (ratio >= FUZZY_THRESHOLD).then(|| (ratio, i, indent_of(win) as i64 - needle_indent))
        })
        .collect();
    if scored.is_empty() {
        return None;
    }
    let best_ratio = scored.iter().map(|&(r, _, _)| r).fold(0.0_f64, f64::max);
    scored.retain(|&(r, _, _)| (r - best_ratio).abs() < 1e-9);
    let positions: Vec<usize> = scored.iter().map(|&(_, i, _)| i).collect();
    let start = resolve_tie(&positions, hint);
    let indent_shift = scored.iter().find(|&&(_, i, _)| i == start).map(|&(_, _, d)| d).unwrap_or(0);
    Some(Placement { start, indent_shift })
}

/// Among several equally-good matches, picks the one whose old-file position
/// is closest to `hint`. With no hint, keeps the first occurrence.
fn resolve_tie(candidates: &[usize], hint: Option<usize>) -> usize {
    if candidates.len() == 1 {
        return candidates[0];
    }
    match hint {
        Some(h) => {
            let target = h.saturating_sub(1);
            *candidates.iter().min_by_key(|&&p| (p as isize - target as isize).unsigned_abs()).unwrap_or(&candidates[0])
        }
        None => candidates[0],
    }
}

fn describe_miss(haystack: &[&str], needle: &[&str]) -> String {
    let mut msg = String::from("Context not found. Expected:\n");
    for l in needle {
        msg.push_str(&format!("  |{l}|\n"));
    }
    if let Some((ratio, line_no, block)) = nearest_block(haystack, needle) {
        msg.push_str(&format!("Nearest match at line {line_no} ({:.0}%):\n", ratio * 100.0));
        for l in &block {
            msg.push_str(&format!("  |{l}|\n"));
        }
    }
    msg.push_str("Re-read the file, fix the context lines, and retry.");
    msg
}

fn nearest_block(haystack: &[&str], needle: &[&str]) -> Option<(f64, usize, Vec<String>)> {
    let len = needle.len().max(1);
    if haystack.len() < len {
        return None;
    }
    let needle_text = needle.join("\n");
    windows(haystack, len)
        .map(|(i, win)| (char_similarity(&needle_text, &win.join("\n")), i + 1, win.iter().map(|s| s.to_string()).collect()))
        .filter(|&(ratio, _, _)| ratio > 0.3)
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
}

// ── Text utilities ─────────────────────────────────────────────────────────────

fn indent_of(lines: &[&str]) -> usize {
    lines.iter().filter(|l| !l.trim().is_empty()).map(|l| l.len() - l.trim_start().len()).min().unwrap_or(0)
}

fn dedent(lines: &[&str], amount: usize) -> Vec<String> {
    lines.iter().map(|l| if l.len() >= amount { l[amount..].to_string() } else { l.trim_start().to_string() }).collect()
}

/// Character-level similarity ratio in [0,1]: twice the matched character
/// count divided by the combined length of both strings.
fn char_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let matched: usize = TextDiff::from_chars(a, b).iter_all_changes().filter(|c| c.tag() == ChangeTag::Equal).map(|c| c.value().len()).sum();
    (matched * 2) as f64 / total as f64
}

fn shift_indent(line: &str, delta: i64) -> String {
    if delta == 0 || line.trim().is_empty() {
        return line.to_string();
    }
    if delta > 0 {
        return format!("{}{line}", " ".repeat(delta as usize));
    }
    let drop = (-delta) as usize;
    if line.len() >= drop && line.as_bytes()[..drop].iter().all(|&b| b == b' ') {
        line[drop..].to_string()
    } else {
        line.trim_start_matches(' ').to_string()
    }
}

// ── Applying a hunk ───────────────────────────────────────────────────────────

fn splice_in(file_lines: &[String], hunk: &EditHunk, placement: Placement) -> Vec<String> {
    let mut out = file_lines[..placement.start].to_vec();
    let mut cursor = placement.start;

    for line in &hunk.lines {
        match line.tag {
            Tag::Context => {
                out.push(file_lines[cursor].clone());
                cursor += 1;
            }
            Tag::Remove => cursor += 1,
            Tag::Insert => out.push(shift_indent(&line.text, placement.indent_shift)),
        }
    }
    out.extend_from_slice(&file_lines[cursor..]);
    out
}

fn apply_all(original: &str, hunks: &[EditHunk]) -> Result<String, String> {
    let had_trailing_newline = original.ends_with('\n');
    let mut lines: Vec<String> = original.lines().map(str::to_string).collect();

    for (idx, hunk) in hunks.iter().enumerate() {
        let placement = locate(&lines, &hunk.needle(), hunk.anchor_hint).map_err(|e| if hunks.len() > 1 { format!("Hunk {}: {e}", idx + 1) } else { e })?;
        lines = splice_in(&lines, hunk, placement);
    }

    let mut result = lines.join("\n");
    if had_trailing_newline {
        result.push('\n');
    }
    Ok(result)
}

// ── Tool ──────────────────────────────────────────────────────────────────────

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by applying unified-diff hunks.\n\
         \n\
         Each hunk starts with @@ (line numbers are optional hints, not required):\n\
           @@ -OLD_LINE,COUNT +NEW_LINE,COUNT @@\n\
            context line          (space prefix — unchanged)\n\
           -removed line          (minus prefix — deleted from file)\n\
           +added line            (plus prefix — inserted into file)\n\
            context line\n\
         \n\
         Include 2-3 unchanged context lines around every change; indentation\n\
         differences between your context and the file are corrected automatically.\n\
         One diff may carry multiple @@ hunks, applied in order. Diffs wrapped in\n\
         ```diff fences are accepted. Re-read the file after any earlier edit before\n\
         writing new context — stale context fails with a nearest-match suggestion."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file to edit"
                },
                "diff": {
                    "type": "string",
                    "description": "Unified diff hunks to apply. Each hunk starts with @@."
                }
            },
            "required": ["path", "diff"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call_id: &str, args: &Value) -> ToolOutput {
        let path = match args.get("path").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return ToolOutput::err(call_id, "Missing required parameter: path"),
        };
        let diff_str = match args.get("diff").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return ToolOutput::err(call_id, "Missing required parameter: diff"),
        };

        debug!(path = %path, "edit_file tool");

        let hunks = match parse_hunks(&diff_str) {
            Ok(h) => h,
            Err(e) => return ToolOutput::err(call_id, e),
        };

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(call_id, format!("read error: {e}")),
        };

        let new_content = match apply_all(&content, &hunks) {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(call_id, e),
        };

        if let Some(parent) = std::path::Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }

        match tokio::fs::write(&path, &new_content).await {
            Ok(_) => ToolOutput::ok(call_id, "Edit successfully applied"),
            Err(e) => ToolOutput::err(call_id, format!("Write failed: {e}")),
        }
    }
}

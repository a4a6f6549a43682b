// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolOutput};

/// Default number of lines returned when the caller does not specify a limit.
/// Kept small to avoid flooding the model context on the first read; the agent
/// can paginate with offset + limit to get more.
const DEFAULT_LINE_LIMIT: usize = 200;

/// Hard byte ceiling applied in addition to the line limit.
/// Whichever constraint is hit first determines where the output is cut.
const MAX_BYTES: usize = 20_000;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Reads a file. Default: 200 lines / 20 KB — whichever comes first.\n\
         Binary files (detected by extension or content) are rendered as Intel HEX;\n\
         limit/offset apply to HEX line numbers (each line = 16 bytes).\n\
         Lines formatted as L{n}:content (1-indexed). For edit_file old_str strip the L{n}: prefix.\n\
         When more lines exist, a pagination notice shows the next offset.\n\
         Strategy: use grep to find the relevant region first, then read only those lines\n\
         with offset+limit. Avoid reading a whole large file — pull only what you need."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-indexed line number to start reading from (default 1)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default 200)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call_id: &str, args: &Value) -> ToolOutput {
        let path = match args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(call_id, "missing required parameter 'path'"),
        };
        let offset = args.get("offset").and_then(|v| v.as_u64()).unwrap_or(1).max(1) as usize;
        let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(DEFAULT_LINE_LIMIT as u64) as usize;

        debug!(path = %path, offset, limit, "read_file tool");

        let resolution = locate(&path);
        let bytes = match tokio::fs::read(resolution.effective_path()).await {
            Ok(b) => b,
            Err(e) => return ToolOutput::err(call_id, format!("read error: {e}")),
        };

        let ext = std::path::Path::new(&path).extension().and_then(|e| e.to_str()).unwrap_or("");
        let page = if is_binary_extension(ext) || looks_binary(&bytes) {
            render_binary_page(&bytes, offset, limit)
        } else {
            render_text_page(&String::from_utf8_lossy(&bytes), offset, limit)
        };

        ToolOutput::ok(call_id, resolution.annotate(page))
    }
}

/// One rendered page of output plus whatever pagination footer applies.
fn finish_page(mut body: String, offset: usize, shown: usize, total: usize, cut_reason: Option<&str>) -> String {
    let last_shown = offset - 1 + shown;
    if last_shown < total {
        let reason = cut_reason.map(str::to_string).unwrap_or_else(|| format!("{} more lines", total - last_shown));
        body.push_str(&format!("\n...[{reason} — showing L{offset}-L{} of {total}; use offset={} to continue]", offset + shown.saturating_sub(1), last_shown + 1));
    }
    body
}

fn render_binary_page(bytes: &[u8], offset: usize, limit: usize) -> String {
    let ihex_lines = to_ihex_lines(bytes);
    let total = ihex_lines.len();
    let start = offset - 1;
    let slice: Vec<&str> = ihex_lines.iter().skip(start).take(limit).map(String::as_str).collect();
    let header = format!("note: binary file ({} bytes) rendered as Intel HEX ({total} lines, 16 bytes/line)\n", bytes.len());
    finish_page(format!("{header}{}", slice.join("\n")), offset, slice.len(), total, None)
}

fn render_text_page(text: &str, offset: usize, limit: usize) -> String {
    let all_lines: Vec<&str> = text.lines().collect();
    let total = all_lines.len();
    let start = offset - 1;

    let mut selected: Vec<String> = Vec::new();
    let mut byte_budget_hit = false;
    let mut used = 0usize;
    for (i, line) in all_lines.iter().enumerate().skip(start).take(limit) {
        let cost = line.len() + 1;
        if used + cost > MAX_BYTES {
            byte_budget_hit = true;
            break;
        }
        selected.push(format!("L{}:{line}", i + 1));
        used += cost;
    }

    let cut_reason = byte_budget_hit.then(|| format!("byte limit ({MAX_BYTES} B) reached"));
    finish_page(selected.join("\n"), offset, selected.len(), total, cut_reason.as_deref())
}

// ── Binary detection ──────────────────────────────────────────────────────────

fn is_binary_extension(ext: &str) -> bool {
    matches!(
        ext.to_ascii_lowercase().as_str(),
        "o" | "a" | "so" | "elf" | "exe" | "dll" | "wasm" | "pdb" |
        "zip" | "gz" | "tar" | "bz2" | "xz" | "7z" | "zst" |
        "bin" | "img" | "rom" | "fw" | "srec" | "s19" | "mot" |
        "pyc" | "pyo" | "class" | "jar" | "war" |
        "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx" | "pdf" |
        "obj" | "lib" |
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "tiff"
    )
}

/// Samples up to 4096 bytes to decide whether content is binary: a null byte
/// anywhere in the sample is conclusive; otherwise more than 30%
/// non-printable bytes (outside TAB/LF/CR/space..~) counts as binary.
fn looks_binary(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let sample = &bytes[..bytes.len().min(4096)];
    if sample.contains(&0u8) {
        return true;
    }
    let non_printable = sample.iter().filter(|&&b| b < 9 || (b > 13 && b < 32)).count();
    non_printable * 100 / sample.len() > 30
}

// ── Intel HEX generation ──────────────────────────────────────────────────────

/// Converts raw bytes to Intel HEX lines: one Extended Linear Address record
/// whenever the upper 16 bits of the address change, one 16-byte data record
/// per chunk, and a trailing `:00000001FF` EOF record.
fn to_ihex_lines(data: &[u8]) -> Vec<String> {
    const BYTES_PER_LINE: usize = 16;
    let mut lines = Vec::with_capacity(data.len() / BYTES_PER_LINE + 2);
    let mut current_segment = usize::MAX;

    for (i, chunk) in data.chunks(BYTES_PER_LINE).enumerate() {
        let addr = i * BYTES_PER_LINE;
        let segment = addr >> 16;
        if segment != current_segment {
            current_segment = segment;
            lines.push(ela_record(segment));
        }
        lines.push(data_record((addr & 0xFFFF) as u16, chunk));
    }
    lines.push(":00000001FF".to_string());
    lines
}

fn ela_record(segment: usize) -> String {
    let hi = (segment >> 8) as u8;
    let lo = (segment & 0xFF) as u8;
    let checksum = ihex_checksum(&[2, 0, 0, 4, hi, lo]);
    format!(":02000004{hi:02X}{lo:02X}{checksum:02X}")
}

fn data_record(addr: u16, chunk: &[u8]) -> String {
    let len = chunk.len() as u8;
    let mut fields = vec![len, (addr >> 8) as u8, (addr & 0xFF) as u8, 0];
    fields.extend_from_slice(chunk);
    let checksum = ihex_checksum(&fields);
    let data_hex: String = chunk.iter().map(|b| format!("{b:02X}")).collect();
    format!(":{len:02X}{addr:04X}00{data_hex}{checksum:02X}")
}

fn ihex_checksum(fields: &[u8]) -> u8 {
    let sum = fields.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    (!sum).wrapping_add(1)
}

// ── Path resolution ────────────────────────────────────────────────────────────

/// Where `read_file` actually found content, and the note (if any) to prepend
/// to the output explaining that the requested path didn't exist as given.
enum Resolution {
    AsGiven(String),
    Ascended { requested: String, found: std::path::PathBuf },
}

impl Resolution {
    fn effective_path(&self) -> &std::path::Path {
        match self {
            Resolution::AsGiven(p) => std::path::Path::new(p),
            Resolution::Ascended { found, .. } => found,
        }
    }

    fn annotate(&self, body: String) -> String {
        match self {
            Resolution::AsGiven(_) => body,
            Resolution::Ascended { found, .. } => format!("note: resolved to {}\n{body}", found.display()),
        }
    }
}

/// For an absolute path that doesn't exist, try dropping one or two "middle"
/// path components at a time to find the file at an ancestor level — the
/// common case of a tool running from a sub-directory while referencing a
/// path relative to a workspace root one level up.
fn locate(path: &str) -> Resolution {
    match ascend_to_find(path) {
        Some(found) => Resolution::Ascended { requested: path.to_string(), found },
        None => Resolution::AsGiven(path.to_string()),
    }
}

fn ascend_to_find(path: &str) -> Option<std::path::PathBuf> {
    use std::path::{Component, Path};

    let p = Path::new(path);
    if !p.is_absolute() || p.exists() {
        return None;
    }

    let parts: Vec<Component> = p.components().collect();
    const MIN_PARTS: usize = 4;
    const MAX_DEPTH: usize = 12;
    if parts.len() < MIN_PARTS || parts.len() > MAX_DEPTH {
        return None;
    }

    for dropped in 1..=2 {
        if let Some(found) = try_dropping(&parts, dropped) {
            return Some(found);
        }
    }
    None
}

/// Tries every position at which `dropped` consecutive interior components
/// could be removed from `parts`, returning the first candidate that exists.
fn try_dropping(parts: &[std::path::Component], dropped: usize) -> Option<std::path::PathBuf> {
    if parts.len() <= dropped + 1 {
        return None;
    }
    (1..=parts.len() - dropped - 1).map(|at| parts[..at].iter().chain(parts[at + dropped..].iter()).collect::<std::path::PathBuf>()).find(|candidate| candidate.exists())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tool::Tool;

    fn tmp_file(content: &str) -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CTR: AtomicU32 = AtomicU32::new(0);
        let n = CTR.fetch_add(1, Ordering::Relaxed);
        let path = format!("/tmp/turnloop_read_file_test_{}_{n}.txt", std::process::id());
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn reads_file_with_line_numbers() {
        let path = tmp_file("alpha\nbeta\ngamma\n");
        let out = ReadFileTool.execute("r1", &json!({"path": path})).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("L1:alpha"));
        assert!(out.content.contains("L2:beta"));
        assert!(out.content.contains("L3:gamma"));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn offset_and_limit_work() {
        let path = tmp_file("line1\nline2\nline3\nline4\nline5\n");
        let out = ReadFileTool.execute("r1", &json!({"path": path, "offset": 2, "limit": 2})).await;
        assert!(!out.is_error);
        assert!(out.content.contains("L2:line2"));
        assert!(out.content.contains("L3:line3"));
        assert!(!out.content.contains("L1:"));
        assert!(!out.content.contains("L4:"));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_file_is_error() {
        let out = ReadFileTool.execute("r1", &json!({"path": "/tmp/turnloop_no_such_file_xyz.txt"})).await;
        assert!(out.is_error);
        assert!(out.content.contains("read error"));
    }

    #[tokio::test]
    async fn missing_file_path_is_error() {
        let out = ReadFileTool.execute("r1", &json!({})).await;
        assert!(out.is_error);
        assert!(out.content.contains("missing required parameter 'path'"));
    }

    #[tokio::test]
    async fn pagination_notice_when_more_lines_exist() {
        let path = tmp_file("a\nb\nc\nd\ne\n");
        let out = ReadFileTool.execute("r1", &json!({"path": path, "limit": 2})).await;
        assert!(!out.is_error);
        assert!(out.content.contains("offset=3"), "{}", out.content);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn no_pagination_notice_when_all_lines_shown() {
        let path = tmp_file("x\ny\n");
        let out = ReadFileTool.execute("r1", &json!({"path": path, "limit": 200})).await;
        assert!(!out.is_error);
        assert!(!out.content.contains("offset="), "{}", out.content);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn byte_cap_truncates_before_line_limit() {
        let line = "x".repeat(49);
        let content: String = (0..500).map(|_| format!("{line}\n")).collect();
        let path = tmp_file(&content);
        let out = ReadFileTool.execute("r1", &json!({"path": path, "limit": 500})).await;
        assert!(!out.is_error);
        assert!(out.content.contains("byte limit"), "{}", out.content);
        let l_count = out.content.lines().filter(|l| l.starts_with('L')).count();
        assert!(l_count < 500, "got {l_count}");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn binary_extension_detected() {
        assert!(is_binary_extension("elf"));
        assert!(is_binary_extension("ELF"));
        assert!(is_binary_extension("o"));
        assert!(is_binary_extension("bin"));
        assert!(is_binary_extension("zip"));
        assert!(is_binary_extension("png"));
        assert!(!is_binary_extension("c"));
        assert!(!is_binary_extension("rs"));
        assert!(!is_binary_extension("txt"));
        assert!(!is_binary_extension("hex"));
    }

    #[test]
    fn null_byte_triggers_binary_detection() {
        let data = b"hello\x00world";
        assert!(looks_binary(data));
    }

    #[test]
    fn high_non_printable_fraction_triggers_binary_detection() {
        let mut data = vec![0x01u8; 40];
        data.extend_from_slice(b"a".repeat(60).as_ref());
        assert!(looks_binary(&data));
    }

    #[test]
    fn normal_text_not_detected_as_binary() {
        let data = b"Hello, world!\nThis is a text file.\n";
        assert!(!looks_binary(data));
    }

    #[test]
    fn empty_file_not_binary() {
        assert!(!looks_binary(b""));
    }

    #[test]
    fn ihex_always_ends_with_eof_record() {
        let lines = to_ihex_lines(b"hello");
        assert_eq!(lines.last().unwrap(), ":00000001FF");
    }

    #[test]
    fn ihex_data_record_format_and_checksum() {
        let lines = to_ihex_lines(&[0xFF]);
        let ela = &lines[0];
        assert!(ela.starts_with(":02000004"), "expected ELA: {ela}");
        let data_rec = &lines[1];
        assert!(data_rec.starts_with(":01000000FF"), "unexpected record: {data_rec}");
    }

    #[test]
    fn ihex_full_16_byte_line() {
        let data = [0u8; 16];
        let lines = to_ihex_lines(&data);
        assert_eq!(lines.len(), 3, "{lines:?}");
        let rec = &lines[1];
        assert!(rec.starts_with(":10000000"), "expected 16-byte record: {rec}");
    }

    #[test]
    fn ihex_ela_emitted_at_64k_boundary() {
        let data = vec![0xAAu8; 65537];
        let lines = to_ihex_lines(&data);
        let ela_count = lines.iter().filter(|l| l.contains("000004")).count();
        assert!(ela_count >= 2, "expected at least 2 ELA records: {ela_count}");
    }

    #[tokio::test]
    async fn binary_file_returns_ihex_output() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CTR: AtomicU32 = AtomicU32::new(0);
        let n = CTR.fetch_add(1, Ordering::Relaxed);
        let path = format!("/tmp/turnloop_binary_test_{}_{n}.bin", std::process::id());
        std::fs::write(&path, b"\x7fELF\x00\x01\x02\x03").unwrap();

        let out = ReadFileTool.execute("r1", &json!({"path": path})).await;
        assert!(!out.is_error, "binary should succeed: {}", out.content);
        assert!(out.content.contains("Intel HEX"), "{}", out.content);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn ascend_finds_file_one_level_up() {
        use std::fs;
        let base = std::env::temp_dir().join(format!("turnloop_ascend_test_{}", std::process::id()));
        let workspace = base.join("workspace");
        let project = workspace.join("project");
        let workspace_subdir = workspace.join("subdir");
        let _ = fs::create_dir_all(&project);
        let _ = fs::create_dir_all(&workspace_subdir);
        let real_file = workspace_subdir.join("file.txt");
        fs::write(&real_file, "hello").unwrap();

        let wrong_path = project.join("subdir").join("file.txt");
        assert!(!wrong_path.exists());

        let found = ascend_to_find(&wrong_path.to_string_lossy());
        assert_eq!(found.as_deref(), Some(real_file.as_path()));

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn ascend_returns_none_for_truly_missing_file() {
        let found = ascend_to_find("/tmp/turnloop_no_such_dir_xyz/no_such_file.txt");
        assert!(found.is_none());
    }

    #[test]
    fn ascend_returns_none_for_relative_path() {
        let found = ascend_to_find("relative/path/file.txt");
        assert!(found.is_none());
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolOutput};

const DEFAULT_MAX_CHARS: usize = 50_000;

pub struct WebFetchTool;

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL and return its content as readable text.\n\n\
         ## Supported\n\
         - http and https only\n\
         - HTML is converted to plain text, JSON is pretty-printed\n\
         - Response capped at 50,000 characters by default\n\n\
         ## Rejected\n\
         - Any other scheme (file, ftp, ...)\n\
         - localhost and private/loopback/link-local addresses\n\
         - Authenticated requests, binary content\n\n\
         ## Examples\n\
         <example>\n\
         web_fetch: url=\"https://docs.example.com/api\"\n\
         </example>\n\
         <example>\n\
         web_fetch: url=\"https://example.com\", max_chars=10000\n\
         </example>"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch (http or https)"
                },
                "max_chars": {
                    "type": "integer",
                    "description": "Maximum characters to return (default 50000)"
                }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call_id: &str, args: &Value) -> ToolOutput {
        let url = match args.get("url").and_then(|v| v.as_str()) {
            Some(u) => u,
            None => return ToolOutput::err(call_id, "missing 'url'"),
        };
        let max_chars = args.get("max_chars").and_then(|v| v.as_u64()).unwrap_or(DEFAULT_MAX_CHARS as u64) as usize;

        if let Err(reason) = reject_disallowed_target(url) {
            return ToolOutput::err(call_id, reason);
        }

        debug!(url, "web_fetch");
        match fetch(url, max_chars).await {
            Ok(content) => ToolOutput::ok(call_id, content),
            Err(e) => ToolOutput::err(call_id, format!("fetch error: {e}")),
        }
    }
}

/// Reject anything the description promises never to touch: a non-http(s)
/// scheme, or a host that resolves to this machine itself. Parsed once here
/// rather than trusted to `reqwest`, which has no opinion on "private IP".
fn reject_disallowed_target(url: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid URL: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported scheme '{other}'; only http/https are allowed")),
    }
    match parsed.host_str() {
        Some(host) if is_disallowed_host(host) => Err(format!("refusing to fetch local/private host '{host}'")),
        Some(_) => Ok(()),
        None => Err("URL has no host".to_string()),
    }
}

fn is_disallowed_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(v4)) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        Ok(std::net::IpAddr::V6(v6)) => v6.is_loopback() || v6.is_unique_local() || v6.is_unicast_link_local(),
        Err(_) => false,
    }
}

async fn fetch(url: &str, max_chars: usize) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .redirect(reqwest::redirect::Policy::limited(3))
        .user_agent("turnloop/0.1")
        .build()?;

    let response = client.get(url).send().await?;
    let content_type = response.headers().get("content-type").and_then(|v| v.to_str().ok()).unwrap_or("").to_lowercase();
    let body = response.text().await?;

    let rendered = render_body(&body, &content_type);
    Ok(truncate_at_char_boundary(&rendered, max_chars))
}

fn render_body(body: &str, content_type: &str) -> String {
    if content_type.contains("html") {
        html2text::from_read(body.as_bytes(), 100)
    } else if content_type.contains("json") {
        serde_json::from_str::<Value>(body).ok().and_then(|v| serde_json::to_string_pretty(&v).ok()).unwrap_or_else(|| body.to_string())
    } else {
        body.to_string()
    }
}

/// Truncates on a `char` boundary — a plain byte-index slice risks splitting
/// a multi-byte UTF-8 sequence and panicking on non-ASCII pages.
fn truncate_at_char_boundary(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let truncated: String = content.chars().take(max_chars).collect();
    let total = content.chars().count();
    format!("{truncated}...[truncated at {max_chars} chars; total {total} chars]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_body_is_converted_to_text() {
        let rendered = render_body("<html><body><h1>Hello</h1><p>World</p></body></html>", "text/html; charset=utf-8");
        assert!(rendered.contains("Hello"));
        assert!(rendered.contains("World"));
        assert!(!rendered.contains("<h1>"));
    }

    #[test]
    fn json_body_is_pretty_printed() {
        let rendered = render_body(r#"{"a":1}"#, "application/json");
        assert!(rendered.contains('\n'));
    }

    #[test]
    fn non_ascii_content_truncates_without_panicking() {
        let content: String = std::iter::repeat('é').take(10).collect();
        let truncated = truncate_at_char_boundary(&content, 5);
        assert!(truncated.starts_with("ééééé"));
    }

    #[test]
    fn localhost_is_rejected() {
        assert!(reject_disallowed_target("http://localhost/secrets").is_err());
        assert!(reject_disallowed_target("http://127.0.0.1:8080/").is_err());
        assert!(reject_disallowed_target("http://10.0.0.5/").is_err());
    }

    #[test]
    fn non_http_scheme_is_rejected() {
        assert!(reject_disallowed_target("file:///etc/passwd").is_err());
    }

    #[test]
    fn ordinary_https_host_is_allowed() {
        assert!(reject_disallowed_target("https://example.com/docs").is_ok());
    }

    #[test]
    fn schema_requires_url() {
        let t = WebFetchTool;
        let schema = t.parameters_schema();
        let required = schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v.as_str() == Some("url")));
    }
}

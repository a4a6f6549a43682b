// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::Instrument;

use crate::{Tool, ToolCall, ToolOutput};

/// Mirrors `turnloop_model::ToolSchema` but keeps the tools crate
/// independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a tool named {0:?} is already registered")]
    DuplicateTool(String),
    #[error("tool name must not be empty")]
    InvalidTool,
}

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
/// The continuation a middleware invokes to run the rest of the chain.
pub type Next = Arc<dyn Fn(ToolCall) -> BoxFuture<ToolOutput> + Send + Sync>;
pub type Middleware = Arc<dyn Fn(ToolCall, Next) -> BoxFuture<ToolOutput> + Send + Sync>;

/// Wraps every dispatch in a `tracing` span and logs success/failure —
/// registered by default so individual tools don't each instrument
/// themselves.
pub fn logging_middleware() -> Middleware {
    Arc::new(|call: ToolCall, next: Next| {
        let span = tracing::info_span!("tool_call", tool.name = %call.name, tool.call_id = %call.id);
        Box::pin(
            async move {
                let call_name = call.name.clone();
                let call_id = call.id.clone();
                let out = next(call).await;
                if out.is_error {
                    tracing::warn!(tool.name = %call_name, tool.call_id = %call_id, "tool call failed");
                } else {
                    tracing::debug!(tool.name = %call_name, tool.call_id = %call_id, "tool call succeeded");
                }
                out
            }
            .instrument(span),
        )
    })
}

/// Central registry holding all available tools and the middleware chain
/// wrapped around every dispatch.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    middleware: Vec<Middleware>,
}

impl ToolRegistry {
    /// A registry with the default logging middleware already installed.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            middleware: vec![logging_middleware()],
        }
    }

    /// A registry with no middleware at all — useful in tests that assert
    /// on dispatch behavior without the default logging span.
    pub fn bare() -> Self {
        Self {
            tools: HashMap::new(),
            middleware: Vec::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if name.is_empty() {
            return Err(RegistryError::InvalidTool);
        }
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateTool(name));
        }
        self.tools.insert(name, Arc::new(tool));
        Ok(())
    }

    /// Append a middleware to the chain. Middleware registered first sees
    /// the call first and the response last (outermost).
    pub fn add_middleware(&mut self, mw: Middleware) {
        self.middleware.push(mw);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispatch a tool call per the registry's five-step contract: missing
    /// tool and argument/validation failures all produce a `ToolOutput`
    /// rather than a dispatch-level error, so the model can recover on its
    /// next turn.
    pub async fn dispatch(&self, call: ToolCall) -> ToolOutput {
        let Some(tool) = self.tools.get(&call.name).cloned() else {
            return ToolOutput::err(&call.id, format!("Tool not found: {}", call.name));
        };

        let args: Value = match serde_json::from_str(&call.arguments) {
            Ok(v) => v,
            Err(e) => {
                return ToolOutput::err(&call.id, format!("invalid arguments: {e}"));
            }
        };

        if let Err(msg) = validate_required(&tool.parameters_schema(), &args) {
            return ToolOutput::err(&call.id, msg);
        }

        let base: Next = {
            let tool = tool.clone();
            let args = args.clone();
            Arc::new(move |call: ToolCall| {
                let tool = tool.clone();
                let args = args.clone();
                Box::pin(async move { tool.execute(&call.id, &args).await }) as BoxFuture<ToolOutput>
            })
        };

        let chain: Next = self.middleware.iter().rev().fold(base, |next, mw| {
            let mw = mw.clone();
            Arc::new(move |call: ToolCall| mw(call, next.clone())) as Next
        });

        chain(call).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Validates that every field named in `schema`'s `required` array is
/// present in `args` and is not a JSON "zero value" for its type (empty
/// string, `0`, `false`, empty array/object).
fn validate_required(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(required) = schema.get("required").and_then(|r| r.as_array()) else {
        return Ok(());
    };
    for field in required {
        let Some(field_name) = field.as_str() else {
            continue;
        };
        match args.get(field_name) {
            None => return Err(format!("missing required field: {field_name}")),
            Some(v) if is_zero_value(v) => {
                return Err(format!("required field {field_name:?} must not be empty"))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn is_zero_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::Bool(b) => !*b,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

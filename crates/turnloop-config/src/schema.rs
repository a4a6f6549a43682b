// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Model endpoint and credential settings for a single provider.
///
/// This is a frozen snapshot handed to `turnloop-model::from_config` — it
/// carries no file-discovery or merging logic of its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Provider id, e.g. `"anthropic"`, `"openai"`, `"google"`, `"mock"`.
    pub provider: String,
    /// Model identifier forwarded to the provider's API.
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Name of an environment variable to read the API key from when
    /// `api_key` is unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Frozen executor configuration.
///
/// Produced once by whatever owns config discovery (the root binary, a test
/// harness) and handed to the executor by value. Nothing in this crate or in
/// `turnloop-core` re-reads it from disk or merges it with other sources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorConfig {
    pub model: ModelConfig,
    /// Maximum number of Step iterations per run. `0` performs zero
    /// iterations and immediately reports `max_turns` exhaustion.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Prepended as a system message when the conversation is empty.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Default per-command shell timeout.
    #[serde(default = "default_shell_timeout_secs")]
    pub shell_timeout_secs: u64,
    /// Event bus queue capacity.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// Upper bound on tool calls dispatched concurrently within one
    /// `ExecuteToolCalls` step. `None` means unbounded.
    #[serde(default)]
    pub max_concurrent_tool_calls: Option<usize>,
}

fn default_max_turns() -> u32 {
    3
}

fn default_shell_timeout_secs() -> u64 {
    30
}

fn default_event_queue_capacity() -> usize {
    256
}

impl ExecutorConfig {
    pub fn new(model: ModelConfig) -> Self {
        Self {
            model,
            max_turns: default_max_turns(),
            system_prompt: None,
            shell_timeout_secs: default_shell_timeout_secs(),
            event_queue_capacity: default_event_queue_capacity(),
            max_concurrent_tool_calls: None,
        }
    }
}

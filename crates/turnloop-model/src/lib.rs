// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod catalog;
pub mod registry;
pub mod sanitize;
pub(crate) mod openai_compat;
mod types;
mod provider;
mod openai;
mod anthropic;
mod google;
mod mock;
mod stream;

pub use catalog::{ModelCatalogEntry, InputModality};
pub use types::*;
pub use provider::ModelClient;
pub use openai::OpenAiModelClient;
pub use anthropic::AnthropicModelClient;
pub use google::GoogleModelClient;
pub use mock::{MockModelClient, ScriptedMockModelClient};
pub use registry::{DriverMeta, get_driver, list_drivers};
pub use stream::ToolCallAggregator;

use openai_compat::{AuthStyle, OpenAICompatProvider};
use turnloop_config::ModelConfig;

/// Construct a boxed [`ModelClient`] from configuration.
///
/// Selects the driver implementation based on `cfg.provider`. Any id not
/// recognised by a native driver is dispatched through the generic
/// OpenAI-compatible client, since `cfg.base_url` is then required to locate
/// the server.
///
/// When `max_tokens` is not set in config, the model's `max_output_tokens` is
/// resolved from the static catalog. If the model is not found there a safe
/// default of 4096 is used.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Box<dyn ModelClient>> {
    let key = || resolve_api_key(cfg);
    let resolved_max_tokens = cfg
        .max_tokens
        .or_else(|| catalog::lookup(&cfg.provider, &cfg.model).map(|e| e.max_output_tokens));

    match cfg.provider.as_str() {
        "openai" => Ok(Box::new(crate::OpenAiModelClient::new(
            cfg.model.clone(),
            key(),
            cfg.base_url.clone(),
            resolved_max_tokens,
            cfg.temperature,
        ))),
        "anthropic" => Ok(Box::new(crate::AnthropicModelClient::new(
            cfg.model.clone(),
            key(),
            cfg.base_url.clone(),
            resolved_max_tokens,
            cfg.temperature,
        ))),
        "google" => Ok(Box::new(crate::GoogleModelClient::new(
            cfg.model.clone(),
            key(),
            cfg.base_url.clone(),
            resolved_max_tokens,
            cfg.temperature,
        ))),
        "mock" => Ok(Box::new(crate::MockModelClient)),

        // Any other provider id is treated as a generic OpenAI-compatible
        // endpoint; base_url must be supplied since there is no registry
        // default to fall back to.
        other => {
            let base_url = cfg.base_url.as_deref().ok_or_else(|| {
                anyhow::anyhow!(
                    "unrecognized model provider {other:?} requires base_url \
                     (treated as a generic OpenAI-compatible endpoint)"
                )
            })?;
            Ok(Box::new(OpenAICompatProvider::new(
                "openai-compat",
                cfg.model.clone(),
                key(),
                base_url,
                resolved_max_tokens,
                cfg.temperature,
                if key().is_some() { AuthStyle::Bearer } else { AuthStyle::None },
            )))
        }
    }
}

fn resolve_api_key(cfg: &ModelConfig) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        return std::env::var(env).ok();
    }
    if let Some(meta) = registry::get_driver(&cfg.provider) {
        if let Some(env_var) = meta.default_api_key_env {
            return std::env::var(env_var).ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(provider: &str, model: &str) -> ModelConfig {
        ModelConfig::new(provider, model)
    }

    #[test]
    fn from_config_openai_succeeds() {
        let cfg = minimal_config("openai", "gpt-4o");
        assert!(from_config(&cfg).is_ok());
    }

    #[test]
    fn from_config_anthropic_succeeds() {
        let cfg = minimal_config("anthropic", "claude-opus-4-6");
        assert!(from_config(&cfg).is_ok());
    }

    #[test]
    fn from_config_google_succeeds() {
        let cfg = minimal_config("google", "gemini-2.0-flash-exp");
        assert!(from_config(&cfg).is_ok());
    }

    #[test]
    fn from_config_mock_succeeds() {
        let cfg = minimal_config("mock", "mock-model");
        assert!(from_config(&cfg).is_ok());
    }

    #[test]
    fn from_config_unrecognized_provider_without_base_url_errors() {
        let cfg = minimal_config("totally_unknown_provider_xyz", "some-model");
        let result = from_config(&cfg);
        assert!(result.is_err());
        let msg = result.err().unwrap().to_string();
        assert!(msg.contains("base_url"));
    }

    #[test]
    fn from_config_unrecognized_provider_with_base_url_succeeds() {
        let mut cfg = minimal_config("my-local-server", "some-model");
        cfg.base_url = Some("http://localhost:8080/v1".into());
        assert!(from_config(&cfg).is_ok());
    }

    #[test]
    fn resolve_api_key_prefers_explicit_key() {
        let mut cfg = minimal_config("openai", "gpt-4o");
        cfg.api_key = Some("explicit-key".into());
        cfg.api_key_env = Some("NONEXISTENT_ENV_VAR_XYZ".into());
        let key = resolve_api_key(&cfg);
        assert_eq!(key.as_deref(), Some("explicit-key"));
    }

    #[test]
    fn resolve_api_key_falls_back_to_registry_default_env() {
        let cfg = minimal_config("openai", "gpt-4o");
        // Cannot assert a value without setting the real env var, but this
        // must not panic and must return None when unset.
        let _ = resolve_api_key(&cfg);
    }
}

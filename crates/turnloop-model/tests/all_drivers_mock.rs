// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tests that every driver registered in the registry can be instantiated from
//! config without error, and that unrecognized providers fall back to the
//! generic OpenAI-compatible client (requiring `base_url`).

use turnloop_config::ModelConfig;
use turnloop_model::{from_config, get_driver, list_drivers, DriverMeta};

fn minimal_cfg(provider: &str) -> ModelConfig {
    ModelConfig::new(provider, "test-model")
}

#[test]
fn registry_is_populated() {
    assert!(!list_drivers().is_empty(), "DRIVERS must not be empty");
    assert!(get_driver("openai").is_some());
    assert!(get_driver("anthropic").is_some());
    assert!(get_driver("google").is_some());
    assert!(get_driver("mock").is_some());
}

#[test]
fn all_registered_drivers_instantiate() {
    for driver in list_drivers() {
        let cfg = minimal_cfg(driver.id);
        assert!(from_config(&cfg).is_ok(), "driver '{}' failed to instantiate from minimal config", driver.id);
    }
}

#[test]
fn unrecognized_provider_without_base_url_errors() {
    let cfg = minimal_cfg("definitely-not-a-real-provider-xyz");
    let err = from_config(&cfg).err().expect("should fail for unrecognized provider without base_url");
    let msg = err.to_string();
    assert!(msg.contains("base_url"), "error should mention base_url, got: {msg}");
}

#[test]
fn unrecognized_provider_with_base_url_succeeds_via_openai_compat() {
    let mut cfg = minimal_cfg("my-local-server");
    cfg.base_url = Some("http://localhost:8080/v1".into());
    assert!(from_config(&cfg).is_ok());
}

#[test]
fn driver_metadata_is_complete() {
    for DriverMeta { id, name, description, .. } in list_drivers() {
        assert!(!id.is_empty(), "driver id must not be empty");
        assert!(!name.is_empty(), "driver '{id}' name must not be empty");
        assert!(!description.is_empty(), "driver '{id}' description must not be empty");
    }
}

#[test]
fn driver_ids_are_lowercase_and_alphanumeric() {
    for d in list_drivers() {
        for ch in d.id.chars() {
            assert!(ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_', "driver id '{}' contains invalid char '{}'", d.id, ch);
        }
    }
}

#[test]
fn mock_driver_requires_no_key() {
    let meta = get_driver("mock").unwrap();
    assert!(!meta.requires_api_key);
    assert!(meta.default_api_key_env.is_none());
}

#[test]
fn native_providers_have_default_api_key_env() {
    for id in ["openai", "anthropic", "google"] {
        let meta = get_driver(id).unwrap_or_else(|| panic!("{id} must be in registry"));
        assert!(meta.requires_api_key, "{id} should require an api key");
        assert!(meta.default_api_key_env.is_some(), "{id} should have a default api key env var");
    }
}

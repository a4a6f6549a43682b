// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Permission policy is consumed here only as a yes/no/confirm decision
//! oracle; evaluating patterns against a tool call is owned by whatever
//! layer sits above the registry, not by this crate.
use async_trait::async_trait;

use crate::tool::ToolCall;

/// A decision returned by a [`PermissionOracle`] for a single tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run without asking.
    Allow,
    /// Ask the caller before running.
    Ask,
    /// Refuse to run.
    Deny,
}

/// Frozen interface the registry consults before dispatching a call.
///
/// Implementations live outside this crate — whatever policy engine a
/// caller wires in (pattern matching, an interactive prompt, a fixed
/// allow-list) only needs to satisfy this trait.
#[async_trait]
pub trait PermissionOracle: Send + Sync {
    async fn decide(&self, call: &ToolCall) -> Decision;
}

/// An oracle that allows every call. Used as the default when no policy is
/// configured, and in tests that don't exercise approval behavior.
pub struct AllowAll;

#[async_trait]
impl PermissionOracle for AllowAll {
    async fn decide(&self, _call: &ToolCall) -> Decision {
        Decision::Allow
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

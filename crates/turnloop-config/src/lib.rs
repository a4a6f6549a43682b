// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Configuration schema for the turn-driven executor.
//!
//! File discovery, layering, and dotted-path reflection are deliberately not
//! part of this crate — callers build an [`ExecutorConfig`] however suits
//! them (CLI flags, a config file, a test fixture) and hand it to the
//! executor as a frozen snapshot.

mod schema;

pub use schema::*;

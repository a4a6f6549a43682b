// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "turnloop",
    about = "Turn-driven tool-calling executor for an interactive coding assistant",
    version,
    long_about = None,
)]
pub struct Cli {
    /// Initial user message. Read from stdin if omitted.
    #[arg(value_name = "PROMPT")]
    pub prompt: Option<String>,

    /// Path to a JSON executor config file.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Path to the SQLite store. Defaults to an in-memory database.
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Continue an existing session by id instead of starting a new one.
    #[arg(long, value_name = "ID")]
    pub session: Option<String>,

    /// Resume the most-recently-updated session. Ignored if `--session`
    /// is also given.
    #[arg(long)]
    pub resume: bool,

    /// Project directory this conversation is scoped to. Defaults to the
    /// current working directory.
    #[arg(long, value_name = "DIR")]
    pub project_dir: Option<PathBuf>,

    /// Model provider id, e.g. "anthropic", "openai", "mock".
    #[arg(long, default_value = "mock")]
    pub provider: String,

    /// Model identifier forwarded to the provider.
    #[arg(long, default_value = "mock-model")]
    pub model: String,

    /// Override the system prompt.
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Maximum number of Step iterations for this run.
    #[arg(long, default_value = "3")]
    pub max_turns: u32,

    /// Increase verbosity (-v = debug, -vv = trace).
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

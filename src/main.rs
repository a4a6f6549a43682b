// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Read;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use uuid::Uuid;

use cli::Cli;
use turnloop_config::{ExecutorConfig, ModelConfig};
use turnloop_core::{Executor, ExecutorError, TurnState};
use turnloop_events::{Event, EventBus, EventProcessor};
use turnloop_store::Store;
use turnloop_tools::{ApplyPatchTool, EditFileTool, GrepTool, ReadFileTool, RunCommandTool, ToolRegistry, WebFetchTool, WriteTool};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(err) = run(cli).await {
        tracing::error!(error = %err, "run failed");
        eprintln!("error: {err:#}");
        std::process::exit(exit_code(&err));
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let prompt = match &cli.prompt {
        Some(p) => p.clone(),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("reading prompt from stdin")?;
            buf
        }
    };

    let store = match &cli.db {
        Some(path) => Store::open(path).await.context("opening store")?,
        None => Store::open_in_memory().await.context("opening in-memory store")?,
    };

    let session_id = cli
        .session
        .as_deref()
        .map(|s| Uuid::parse_str(s))
        .transpose()
        .map_err(|e| anyhow::Error::new(UsageError(format!("--session must be a UUID: {e}"))))?;
    let session = store.get_or_create_session(session_id, cli.resume).await?;

    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let project_dir = project_dir.canonicalize().with_context(|| format!("canonicalizing {}", project_dir.display()))?;
    let conversation = store
        .get_or_create_conversation(session.id, project_dir.display().to_string())
        .await?;
    let conversation_id = conversation.id;

    let config = build_config(&cli).map_err(|e| anyhow::Error::new(ConfigError(e.to_string())))?;

    let shell = Arc::new(turnloop_shell::Shell::open().await.context("opening shell")?);
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool).ok();
    registry.register(WriteTool).ok();
    registry.register(EditFileTool).ok();
    registry.register(ApplyPatchTool).ok();
    registry.register(GrepTool).ok();
    registry.register(WebFetchTool).ok();
    registry.register(RunCommandTool::new(shell, config.shell_timeout_secs)).ok();

    let bus = Arc::new(EventBus::spawn(config.event_queue_capacity, vec![Box::new(ConsoleEventProcessor)]));
    let model = turnloop_model::from_config(&config.model).map_err(|e| anyhow::Error::new(ConfigError(e.to_string())))?;

    let executor = Executor::new(store, Arc::new(registry), bus.clone(), model, config);
    executor.submit_user_message(conversation_id, prompt).await?;

    loop {
        match executor.step(conversation_id).await? {
            TurnState::TextResponse { content } => {
                if !content.is_empty() {
                    println!("{content}");
                }
                break;
            }
            TurnState::ToolCallsNeeded { calls } => {
                executor.execute_tool_calls(conversation_id, calls).await?;
            }
            TurnState::ToolCallsCompleted => continue,
            TurnState::Error { message } => {
                anyhow::bail!("executor error: {message}");
            }
        }
    }

    Ok(())
}

fn build_config(cli: &Cli) -> anyhow::Result<ExecutorConfig> {
    if let Some(path) = &cli.config {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: ExecutorConfig = serde_json::from_str(&text).context("parsing config file")?;
        if let Some(prompt) = &cli.system_prompt {
            config.system_prompt = Some(prompt.clone());
        }
        return Ok(config);
    }

    let mut config = ExecutorConfig::new(ModelConfig::new(cli.provider.clone(), cli.model.clone()));
    config.max_turns = cli.max_turns;
    config.system_prompt = cli.system_prompt.clone();
    Ok(config)
}

/// Wraps a config-file-parsing or model-construction failure so `exit_code`
/// can tell it apart from a network or storage error further down the stack.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct ConfigError(String);

/// Wraps a bad CLI argument (e.g. a malformed `--session` id).
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct UsageError(String);

/// Logs every event to stderr at debug level. A placeholder for richer
/// consumers (a TUI, a JSONL writer) that would subscribe to the same bus.
struct ConsoleEventProcessor;

#[async_trait]
impl EventProcessor for ConsoleEventProcessor {
    async fn process(&self, event: &Event) -> Result<(), anyhow::Error> {
        tracing::debug!(?event, "event");
        Ok(())
    }
}

/// Maps a top-level error to the process exit code per the error taxonomy:
/// 0 success, 1 general, 2 usage, 3 config, 4 auth, 5 permission, 6 network,
/// 7 timeout, 8 interrupted, 9 internal.
fn exit_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<UsageError>().is_some() {
        return 2;
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return 3;
    }
    if let Some(e) = err.downcast_ref::<ExecutorError>() {
        return match e {
            ExecutorError::Store(turnloop_store::StoreError::SessionNotFound(_)) => 2,
            ExecutorError::Store(_) => 9,
            ExecutorError::Model(_) => 6,
            ExecutorError::ConversationNotFound(_) => 2,
        };
    }
    if let Some(turnloop_store::StoreError::SessionNotFound(_)) = err.downcast_ref::<turnloop_store::StoreError>() {
        return 2;
    }
    if let Some(e) = err.downcast_ref::<turnloop_shell::ShellError>() {
        return match e {
            turnloop_shell::ShellError::Timeout(_) => 7,
            turnloop_shell::ShellError::Cancelled => 8,
            turnloop_shell::ShellError::Rejected(_) => 5,
            _ => 9,
        };
    }
    1
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry().with(fmt::layer().with_target(true)).with(filter).try_init();
}

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use turnloop_config::ExecutorConfig;
use turnloop_events::{Event, EventBus, EventPayload, ToolCallSummary};
use turnloop_model::{CompletionRequest, ModelClient, ResponseEvent, ToolCallAggregator, ToolSchema as ModelToolSchema};
use turnloop_store::Store;
use turnloop_tools::{ToolCall, ToolOutput, ToolRegistry};

use crate::conversation::{build_model_messages, ConversationState};
use crate::error::ExecutorError;

/// The four states a turn can be in. The initial state of a fresh turn is
/// treated as `ToolCallsCompleted` — ready for the next `Step`.
#[derive(Debug, Clone)]
pub enum TurnState {
    TextResponse { content: String },
    ToolCallsNeeded { calls: Vec<ToolCall> },
    ToolCallsCompleted,
    Error { message: String },
}

/// Orchestrates one conversation at a time: drives the model, dispatches
/// tool calls, persists every message, and publishes lifecycle events.
pub struct Executor {
    store: Store,
    registry: Arc<ToolRegistry>,
    bus: Arc<EventBus>,
    model: Box<dyn ModelClient>,
    config: ExecutorConfig,
    turns_used: Mutex<HashMap<Uuid, u32>>,
}

impl Executor {
    pub fn new(store: Store, registry: Arc<ToolRegistry>, bus: Arc<EventBus>, model: Box<dyn ModelClient>, config: ExecutorConfig) -> Self {
        Self { store, registry, bus, model, config, turns_used: Mutex::new(HashMap::new()) }
    }

    async fn turns_remaining(&self, conversation_id: Uuid) -> u32 {
        let used = self.turns_used.lock().await.get(&conversation_id).copied().unwrap_or(0);
        self.config.max_turns.saturating_sub(used)
    }

    async fn record_turn(&self, conversation_id: Uuid) -> u32 {
        let mut guard = self.turns_used.lock().await;
        let entry = guard.entry(conversation_id).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Persist a user message and emit `user_message`. Skipped entirely
    /// when `turns_remaining` is already zero, matching `max_turns = 0`'s
    /// "no `Step` iterations occur; no `user_message` event is even
    /// emitted" boundary behavior.
    pub async fn submit_user_message(&self, conversation_id: Uuid, content: impl Into<String>) -> Result<(), ExecutorError> {
        if self.turns_remaining(conversation_id).await == 0 {
            return Ok(());
        }
        let content = content.into();
        self.store.append_user_message(conversation_id, content.clone()).await?;
        let turn_number = self.turns_used.lock().await.get(&conversation_id).copied().unwrap_or(0);
        self.emit(conversation_id, turn_number, EventPayload::UserMessage { content }).await;
        Ok(())
    }

    /// Run one model round: builds the request from the materialized
    /// conversation, streams the response, persists the assistant message,
    /// and reports whether the turn needs tool dispatch.
    pub async fn step(&self, conversation_id: Uuid) -> Result<TurnState, ExecutorError> {
        let span = info_span!("step", %conversation_id);
        async {
            let remaining = self.turns_remaining(conversation_id).await;
            if remaining == 0 {
                let total_turns = self.config.max_turns;
                self.emit(conversation_id, total_turns, EventPayload::ConversationComplete {
                    reason: "max_turns".into(),
                    total_turns,
                })
                .await;
                return Ok(TurnState::TextResponse { content: String::new() });
            }

            let turn_number = self.record_turn(conversation_id).await;

            let materialized = self.store.list_messages(conversation_id).await?;
            let tools_enabled = !self.registry.schemas().is_empty();
            let state = ConversationState::compute(&materialized, remaining, tools_enabled);

            let messages = build_model_messages(&materialized, &state, self.config.system_prompt.as_deref());
            let tools: Vec<ModelToolSchema> = if state.tools_enabled {
                self.registry
                    .schemas()
                    .into_iter()
                    .map(|s| ModelToolSchema { name: s.name, description: s.description, parameters: s.parameters })
                    .collect()
            } else {
                Vec::new()
            };

            let request = CompletionRequest { messages, tools, stream: true };

            self.emit(conversation_id, turn_number, EventPayload::AssistantStreamStart).await;

            let mut stream = match self.model.complete(request).await {
                Ok(s) => s,
                Err(e) => return self.fail_step(conversation_id, turn_number, e.to_string()).await,
            };

            let mut content = String::new();
            let mut aggregator = ToolCallAggregator::new();
            let mut stream_error: Option<String> = None;

            while let Some(event) = stream.next().await {
                match event {
                    Ok(ResponseEvent::ContentDelta(delta)) => {
                        content.push_str(&delta);
                        self.emit(conversation_id, turn_number, EventPayload::AssistantStreamChunk { delta }).await;
                    }
                    Ok(ev @ ResponseEvent::ToolCallDelta(_)) | Ok(ev @ ResponseEvent::ToolCallsReplace(_)) => {
                        aggregator.push(&ev);
                    }
                    Ok(ResponseEvent::Done) => break,
                    Ok(ResponseEvent::Error(msg)) => {
                        stream_error = Some(msg);
                        break;
                    }
                    Err(e) => {
                        stream_error = Some(e.to_string());
                        break;
                    }
                }
            }

            if let Some(msg) = stream_error {
                return self.fail_step(conversation_id, turn_number, msg).await;
            }

            self.emit(conversation_id, turn_number, EventPayload::AssistantStreamEnd).await;

            let tool_calls = aggregator.finish();

            // A stream that produced neither text nor tool calls is not worth a
            // Store round-trip; treat it as an empty TextResponse directly.
            if tool_calls.is_empty() && content.is_empty() {
                self.emit(conversation_id, turn_number, EventPayload::TurnComplete).await;
                return Ok(TurnState::TextResponse { content });
            }

            let store_tool_calls: Vec<turnloop_store::ToolCallRecord> = tool_calls
                .iter()
                .map(|f| turnloop_store::ToolCallRecord { id: f.id.clone(), name: f.name.clone(), arguments: f.arguments.clone() })
                .collect();

            self.store
                .append_assistant_message(conversation_id, &self.config.model.provider, &self.config.model.model, content.clone(), store_tool_calls.clone())
                .await?;

            self.emit(conversation_id, turn_number, EventPayload::AssistantMessage {
                content: content.clone(),
                tool_calls: store_tool_calls
                    .iter()
                    .map(|tc| ToolCallSummary { id: tc.id.clone(), name: tc.name.clone(), arguments: tc.arguments.clone() })
                    .collect(),
            })
            .await;

            if tool_calls.is_empty() {
                self.emit(conversation_id, turn_number, EventPayload::TurnComplete).await;
                Ok(TurnState::TextResponse { content })
            } else {
                let calls = tool_calls.into_iter().map(|f| ToolCall { id: f.id, name: f.name, arguments: f.arguments }).collect();
                Ok(TurnState::ToolCallsNeeded { calls })
            }
        }
        .instrument(span)
        .await
    }

    async fn fail_step(&self, conversation_id: Uuid, turn_number: u32, message: String) -> Result<TurnState, ExecutorError> {
        warn!(%conversation_id, error = %message, "model stream failed");
        let _ = self
            .store
            .append_system_message(conversation_id, format!("stream error: {message}"))
            .await;
        self.emit(conversation_id, turn_number, EventPayload::Error { message: message.clone() }).await;
        Ok(TurnState::Error { message })
    }

    /// Dispatch every call concurrently (bounded by
    /// `max_concurrent_tool_calls` when set), persist each result, and
    /// record an audit row per call.
    pub async fn execute_tool_calls(&self, conversation_id: Uuid, calls: Vec<ToolCall>) -> Result<Vec<ToolOutput>, ExecutorError> {
        let turn_number = self.turns_used.lock().await.get(&conversation_id).copied().unwrap_or(0);

        for call in &calls {
            self.emit(conversation_id, turn_number, EventPayload::ToolCallRequest {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            })
            .await;
        }

        let semaphore = self.config.max_concurrent_tool_calls.map(|n| Arc::new(tokio::sync::Semaphore::new(n.max(1))));

        let outputs = futures::future::join_all(calls.into_iter().map(|call| {
            let registry = self.registry.clone();
            let semaphore = semaphore.clone();
            async move {
                let _permit = match &semaphore {
                    Some(s) => Some(s.acquire().await.expect("semaphore closed")),
                    None => None,
                };
                let started_at = Utc::now();
                let output = registry.dispatch(call.clone()).await;
                (call, output, started_at, Utc::now())
            }
        }))
        .await;

        let mut results = Vec::with_capacity(outputs.len());
        for (call, output, started_at, finished_at) in outputs {
            // `registry.dispatch` never returns a bare error — a missing tool,
            // bad arguments, or a tool-reported failure all come back as a
            // `ToolOutput` with `is_error = true` and are reported the same way,
            // via `tool_call_response`. `tool_call_error` is reserved for a
            // dispatch that failed before producing any `ToolOutput` at all,
            // which the registry's current contract never does.
            self.emit(conversation_id, turn_number, EventPayload::ToolCallResponse {
                tool_call_id: output.call_id.clone(),
                content: output.content.clone(),
                is_error: output.is_error,
            })
            .await;

            let append_result = self
                .store
                .append_tool_result_message(conversation_id, output.call_id.clone(), call.name.clone(), output.content.clone())
                .await;

            match append_result {
                Ok(message) => {
                    let duration_ms = (finished_at - started_at).num_milliseconds().max(0);
                    let (output_field, error_field) = if output.is_error {
                        (format!("Error: {}", output.content), output.content.clone())
                    } else {
                        (output.content.clone(), String::new())
                    };
                    if let Err(e) = self
                        .store
                        .record_tool_execution(
                            conversation_id,
                            message.id,
                            output.call_id.clone(),
                            &self.config.model.provider,
                            &self.config.model.model,
                            call.name.clone(),
                            call.arguments.clone(),
                            output_field,
                            error_field,
                            duration_ms,
                        )
                        .await
                    {
                        warn!(%conversation_id, error = %e, "failed to record tool execution audit row");
                    }
                }
                Err(e) => {
                    warn!(%conversation_id, error = %e, "failed to persist tool result message");
                    self.emit(conversation_id, turn_number, EventPayload::Error {
                        message: format!("failed to persist tool result for {}: {e}", call.name),
                    })
                    .await;
                }
            }

            results.push(output);
        }

        debug!(%conversation_id, n = results.len(), "tool calls completed");
        Ok(results)
    }

    async fn emit(&self, conversation_id: Uuid, turn_number: u32, payload: EventPayload) {
        if let Err(e) = self.bus.send(Event::new(conversation_id, turn_number, payload)).await {
            warn!(%conversation_id, error = %e, "failed to publish event");
        }
    }
}

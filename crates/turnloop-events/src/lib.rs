// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! A bounded event bus that fans turn-loop events out to every registered
//! processor, in registration order, preserving per-conversation ordering.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus is closed")]
    SinkClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    UserMessage { content: String },
    AssistantStreamStart,
    AssistantStreamChunk { delta: String },
    AssistantStreamEnd,
    AssistantMessage { content: String, tool_calls: Vec<ToolCallSummary> },
    ToolCallRequest { tool_call_id: String, name: String, arguments: String },
    ToolCallResponse { tool_call_id: String, content: String, is_error: bool },
    ToolCallError { tool_call_id: String, error: String },
    SystemMessage { content: String },
    Error { message: String },
    TurnComplete,
    ConversationComplete { reason: String, total_turns: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// The common envelope every event carries, regardless of payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub conversation_id: Uuid,
    pub turn_number: u32,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(conversation_id: Uuid, turn_number: u32, payload: EventPayload) -> Self {
        Self { timestamp: Utc::now(), conversation_id, turn_number, payload }
    }
}

/// Implemented by anything that wants to observe bus events — a renderer,
/// a logger, a persistence sink. A processor returning an error is logged
/// but never stops delivery to the processors registered after it.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    async fn process(&self, event: &Event) -> Result<(), anyhow::Error>;
    async fn close(&self) {}
}

pub struct EventBus {
    sender: mpsc::Sender<Event>,
    worker: Option<JoinHandle<Vec<Box<dyn EventProcessor>>>>,
}

impl EventBus {
    /// Spawn the worker task owning `capacity`-bounded queue and fanning
    /// each event out to `processors` in order.
    pub fn spawn(capacity: usize, processors: Vec<Box<dyn EventProcessor>>) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Event>(capacity);

        let worker = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                for processor in &processors {
                    if let Err(e) = processor.process(&event).await {
                        warn!(error = %e, "event processor failed");
                    }
                }
            }
            processors
        });

        Self { sender, worker: Some(worker) }
    }

    /// Non-blocking send; returns `SinkClosed` if the worker has shut down
    /// or the bounded queue rejects sends outright (full queues back off
    /// instead — the worker drains continuously, so sustained backpressure
    /// here indicates a closed bus).
    pub async fn send(&self, event: Event) -> Result<(), BusError> {
        self.sender.send(event).await.map_err(|_| BusError::SinkClosed)
    }

    pub fn try_send(&self, event: Event) -> Result<(), BusError> {
        self.sender.try_send(event).map_err(|_| BusError::SinkClosed)
    }

    /// Drain the queue, join the worker, then close every processor in
    /// registration order.
    pub async fn close(mut self) {
        drop(self.sender);
        if let Some(handle) = self.worker.take() {
            match handle.await {
                Ok(processors) => {
                    for processor in &processors {
                        processor.close().await;
                    }
                }
                Err(e) => error!(error = %e, "event bus worker panicked"),
            }
        }
    }
}

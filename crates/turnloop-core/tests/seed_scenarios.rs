// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end turn-loop scenarios, each driven against a
//! `ScriptedMockModelClient`, an in-memory `Store`, and a recording
//! `EventProcessor` — the combination a real CLI invocation assembles, minus
//! the network and the terminal.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use turnloop_config::{ExecutorConfig, ModelConfig};
use turnloop_core::{Executor, TurnState};
use turnloop_events::{Event, EventBus, EventPayload, EventProcessor};
use turnloop_model::{MockModelClient, ResponseEvent, ScriptedMockModelClient, ToolCallFragment};
use turnloop_store::Store;
use turnloop_tools::{Tool, ToolOutput, ToolRegistry};
use uuid::Uuid;

struct RecordingProcessor {
    events: Arc<StdMutex<Vec<EventPayload>>>,
}

#[async_trait]
impl EventProcessor for RecordingProcessor {
    async fn process(&self, event: &Event) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.payload.clone());
        Ok(())
    }
}

async fn harness(model: Box<dyn turnloop_model::ModelClient>, registry: ToolRegistry, max_turns: u32) -> (Executor, Uuid, Arc<StdMutex<Vec<EventPayload>>>) {
    let store = Store::open_in_memory().await.unwrap();
    let session = store.get_or_create_session(None, false).await.unwrap();
    let conversation = store.get_or_create_conversation(session.id, "/tmp/project").await.unwrap();
    let events = Arc::new(StdMutex::new(Vec::new()));
    let bus = Arc::new(EventBus::spawn(256, vec![Box::new(RecordingProcessor { events: events.clone() })]));
    let mut config = ExecutorConfig::new(ModelConfig::new("mock", "mock-model"));
    config.max_turns = max_turns;
    let executor = Executor::new(store, Arc::new(registry), bus, model, config);
    (executor, conversation.id, events)
}

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "echoes its input"
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": { "text": { "type": "string" } }, "required": ["text"] })
    }
    async fn execute(&self, call_id: &str, args: &Value) -> ToolOutput {
        ToolOutput::ok(call_id, args.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string())
    }
}

/// (1) Single-turn plain-text exchange: a user message produces an assistant
/// text reply and the turn ends as a `TextResponse`, with no tool-call
/// events on the bus.
#[tokio::test]
async fn single_turn_plain_text_exchange() {
    let (executor, conv, events) = harness(Box::new(MockModelClient), ToolRegistry::bare(), 3).await;
    executor.submit_user_message(conv, "hello there").await.unwrap();

    match executor.step(conv).await.unwrap() {
        TurnState::TextResponse { content } => assert!(content.contains("MOCK: hello there")),
        other => panic!("expected TextResponse, got {other:?}"),
    }

    let recorded = events.lock().unwrap();
    assert!(recorded.iter().any(|e| matches!(e, EventPayload::UserMessage { content } if content == "hello there")));
    assert!(recorded.iter().any(|e| matches!(e, EventPayload::AssistantMessage { .. })));
    assert!(recorded.iter().any(|e| matches!(e, EventPayload::TurnComplete)));
    assert!(!recorded.iter().any(|e| matches!(e, EventPayload::ToolCallRequest { .. })));
}

/// (2) Single tool call, clean success: the model asks for one tool, it
/// dispatches without error, and the model's follow-up turn produces the
/// final text.
#[tokio::test]
async fn single_tool_call_clean_success() {
    let model = ScriptedMockModelClient::tool_then_text("call-1", "echo", r#"{"text":"hi"}"#, "all done");
    let mut registry = ToolRegistry::bare();
    registry.register(EchoTool).unwrap();
    let (executor, conv, events) = harness(Box::new(model), registry, 3).await;
    executor.submit_user_message(conv, "run the tool").await.unwrap();

    let calls = match executor.step(conv).await.unwrap() {
        TurnState::ToolCallsNeeded { calls } => calls,
        other => panic!("expected ToolCallsNeeded, got {other:?}"),
    };
    assert_eq!(calls.len(), 1);

    let outputs = executor.execute_tool_calls(conv, calls).await.unwrap();
    assert!(!outputs[0].is_error);
    assert_eq!(outputs[0].content, "hi");

    match executor.step(conv).await.unwrap() {
        TurnState::TextResponse { content } => assert_eq!(content, "all done"),
        other => panic!("expected TextResponse, got {other:?}"),
    }

    let recorded = events.lock().unwrap();
    assert!(recorded.iter().any(|e| matches!(e, EventPayload::ToolCallRequest { name, .. } if name == "echo")));
    assert!(recorded.iter().any(|e| matches!(e, EventPayload::ToolCallResponse { is_error: false, .. })));
}

/// (3) Multi tool call turn where one call fails validation and one
/// succeeds: both results are reported, neither short-circuits the other,
/// and the turn proceeds to a follow-up model call.
#[tokio::test]
async fn multi_tool_call_mixed_validation_outcome() {
    let model = ScriptedMockModelClient::new(vec![
        vec![
            ResponseEvent::ToolCallDelta(ToolCallFragment { id: "call-ok".into(), name: "echo".into(), arguments: r#"{"text":"fine"}"#.into() }),
            ResponseEvent::ToolCallDelta(ToolCallFragment { id: "call-bad".into(), name: "echo".into(), arguments: r#"{}"#.into() }),
            ResponseEvent::Done,
        ],
        vec![ResponseEvent::ContentDelta("both handled".into()), ResponseEvent::Done],
    ]);
    let mut registry = ToolRegistry::bare();
    registry.register(EchoTool).unwrap();
    let (executor, conv, events) = harness(Box::new(model), registry, 3).await;
    executor.submit_user_message(conv, "run both").await.unwrap();

    let calls = match executor.step(conv).await.unwrap() {
        TurnState::ToolCallsNeeded { calls } => calls,
        other => panic!("expected ToolCallsNeeded, got {other:?}"),
    };
    assert_eq!(calls.len(), 2);

    let outputs = executor.execute_tool_calls(conv, calls).await.unwrap();
    let ok = outputs.iter().find(|o| o.call_id == "call-ok").unwrap();
    let bad = outputs.iter().find(|o| o.call_id == "call-bad").unwrap();
    assert!(!ok.is_error);
    assert_eq!(ok.content, "fine");
    assert!(bad.is_error);
    assert!(bad.content.contains("missing required field"));

    match executor.step(conv).await.unwrap() {
        TurnState::TextResponse { content } => assert_eq!(content, "both handled"),
        other => panic!("expected TextResponse, got {other:?}"),
    }

    let recorded = events.lock().unwrap();
    let responses: Vec<_> = recorded.iter().filter(|e| matches!(e, EventPayload::ToolCallResponse { .. })).collect();
    assert_eq!(responses.len(), 2, "both the valid and the invalid call report a response, not a dispatch error");
}

/// (4) Shell containment: a command that `cd`s outside `original_directory`
/// is pulled back by the shell itself, verified by a second command run
/// through the same tool.
#[tokio::test]
async fn shell_containment_resets_after_escape_attempt() {
    let shell = Arc::new(turnloop_shell::Shell::open().await.unwrap());
    let original = shell.original_directory().to_path_buf();
    let run_command = turnloop_tools::RunCommandTool::new(shell, 30);

    let escape = run_command.execute("c1", &json!({"command": "cd / && cd /tmp"})).await;
    assert!(!escape.is_error, "escaping the shell's own home should still succeed at the process level: {}", escape.content);

    let check = run_command.execute("c2", &json!({"command": "pwd"})).await;
    assert!(!check.is_error);
    assert!(
        check.content.trim_start().starts_with(&original.display().to_string()),
        "expected pwd to report the original directory, got: {}",
        check.content
    );
}

/// (5) A tool call naming an unregistered tool produces a
/// `tool_call_response` with `is_error = true`, not a `tool_call_error`
/// event or a dispatch panic — the registry never fails dispatch itself,
/// it just reports "Tool not found" as an ordinary tool result.
#[tokio::test]
async fn unregistered_tool_recovers_with_tool_call_response() {
    let model = ScriptedMockModelClient::tool_then_text("call-1", "does_not_exist", "{}", "never reached");
    let (executor, conv, events) = harness(Box::new(model), ToolRegistry::bare(), 3).await;
    executor.submit_user_message(conv, "run it").await.unwrap();

    let calls = match executor.step(conv).await.unwrap() {
        TurnState::ToolCallsNeeded { calls } => calls,
        other => panic!("expected ToolCallsNeeded, got {other:?}"),
    };
    let outputs = executor.execute_tool_calls(conv, calls).await.unwrap();
    assert!(outputs[0].is_error);
    assert!(outputs[0].content.starts_with("Tool not found: "));

    let recorded = events.lock().unwrap();
    assert!(recorded.iter().any(|e| matches!(e, EventPayload::ToolCallResponse { is_error: true, .. })));
    assert!(!recorded.iter().any(|e| matches!(e, EventPayload::ToolCallError { .. })));
}

/// (6) Event-bus backpressure: a bus with capacity 1 paired with a
/// deliberately slow processor still delivers every event, in order, once
/// the processor catches up.
#[tokio::test]
async fn backpressured_bus_delivers_every_event_in_order() {
    struct SlowRecorder {
        events: Arc<StdMutex<Vec<EventPayload>>>,
    }

    #[async_trait]
    impl EventProcessor for SlowRecorder {
        async fn process(&self, event: &Event) -> anyhow::Result<()> {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            self.events.lock().unwrap().push(event.payload.clone());
            Ok(())
        }
    }

    let events = Arc::new(StdMutex::new(Vec::new()));
    let bus = EventBus::spawn(1, vec![Box::new(SlowRecorder { events: events.clone() })]);
    let conv = Uuid::new_v4();

    for i in 0..20u32 {
        bus.send(Event::new(conv, i, EventPayload::AssistantStreamChunk { delta: i.to_string() })).await.unwrap();
    }
    bus.close().await;

    let recorded = events.lock().unwrap();
    assert_eq!(recorded.len(), 20, "every event sent into a backpressured bus is still delivered");
    let deltas: Vec<&str> = recorded
        .iter()
        .map(|e| match e {
            EventPayload::AssistantStreamChunk { delta } => delta.as_str(),
            other => panic!("unexpected payload: {other:?}"),
        })
        .collect();
    let expected: Vec<String> = (0..20u32).map(|i| i.to_string()).collect();
    assert_eq!(deltas, expected, "ordering is preserved despite backpressure");
}

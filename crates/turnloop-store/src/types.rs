use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `None` until a conversation has actually been started in this
    /// session; if set, always appears in `conversation_ids`.
    pub current_conversation_id: Option<Uuid>,
    pub conversation_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub session_id: Uuid,
    pub title: Option<String>,
    /// Absolute, canonical path of the project this conversation is
    /// scoped to.
    pub project_directory: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turn_number: u32,
}

/// A tool call as attached to an assistant message. `arguments` is stored
/// as a JSON-encoded string, not a parsed `Value`, so the persisted
/// representation stays provider-agnostic; parsing happens once, at
/// dispatch time, inside the tool registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    /// The provider/model that produced this message. `None` for `system`
    /// and `user` messages, which no model call produced.
    pub provider: Option<String>,
    pub model: Option<String>,
    pub content: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit record of a single tool invocation. `tool_call_id` is kept
/// alongside `message_id` so a specific call is addressable when an
/// assistant message requested more than one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub tool_call_id: String,
    pub provider: String,
    pub model: String,
    pub tool_name: String,
    pub input: String,
    /// Serialized tool output on success; `"Error: <msg>"` on failure.
    pub output: String,
    /// Empty on success, the error message on failure.
    pub error: String,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Persistence for sessions, conversations, messages, and tool-execution
//! audit records, backed by an embedded SQLite database.

mod error;
mod migrations;
pub mod types;

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

pub use error::StoreError;
pub use types::{Conversation, Message, Role, Session, ToolCallRecord, ToolExecution};

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if absent) the database at `path`, applying any
    /// pending migrations transactionally before returning.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let mut conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", true)?;
            migrations::run(&mut conn)?;
            Ok(conn)
        })
        .await??;

        debug!("store opened");
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// In-memory store, for tests and ephemeral sessions.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection, StoreError> {
            let mut conn = Connection::open_in_memory()?;
            migrations::run(&mut conn)?;
            Ok(conn)
        })
        .await??;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub async fn close(self) -> Result<(), StoreError> {
        debug!("store closed");
        Ok(())
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("store connection mutex poisoned");
            f(&guard)
        })
        .await?
    }

    /// Resolve a session per §4.1: an explicit `id` is fetched and fails
    /// with `SessionNotFound` if absent; otherwise, if `resume`, the
    /// most-recently-updated session is fetched, creating a new one only
    /// if none exists; otherwise a new session is always created.
    pub async fn get_or_create_session(&self, id: Option<Uuid>, resume: bool) -> Result<Session, StoreError> {
        debug!(?id, resume, "get_or_create_session");
        self.run_blocking(move |conn| {
            if let Some(id) = id {
                return load_session(conn, id)?.ok_or(StoreError::SessionNotFound(id));
            }

            if resume {
                if let Some(session) = load_most_recently_updated_session(conn)? {
                    return Ok(session);
                }
            }

            let session_id = Uuid::new_v4();
            let now = Utc::now();
            conn.execute(
                "INSERT INTO sessions (id, created_at, updated_at, current_conversation_id) VALUES (?1, ?2, ?3, NULL)",
                params![session_id.to_string(), now.to_rfc3339(), now.to_rfc3339()],
            )?;

            Ok(Session { id: session_id, created_at: now, updated_at: now, current_conversation_id: None, conversation_ids: vec![] })
        })
        .await
    }

    /// Return `session`'s current conversation if it has one, otherwise
    /// start a new conversation scoped to `project_directory` and make it
    /// current.
    pub async fn get_or_create_conversation(&self, session_id: Uuid, project_directory: impl Into<String>) -> Result<Conversation, StoreError> {
        let project_directory = project_directory.into();
        debug!(%session_id, "get_or_create_conversation");
        self.run_blocking(move |conn| {
            let current: Option<String> = conn.query_row(
                "SELECT current_conversation_id FROM sessions WHERE id = ?1",
                params![session_id.to_string()],
                |row| row.get(0),
            )?;

            if let Some(current) = current.and_then(|s| Uuid::parse_str(&s).ok()) {
                if let Some(conversation) = load_conversation(conn, current)? {
                    return Ok(conversation);
                }
            }

            let conversation_id = Uuid::new_v4();
            let now = Utc::now();
            conn.execute(
                "INSERT INTO conversations (id, session_id, title, project_directory, turn_number, created_at, updated_at)
                 VALUES (?1, ?2, NULL, ?3, 0, ?4, ?4)",
                params![conversation_id.to_string(), session_id.to_string(), project_directory, now.to_rfc3339()],
            )?;
            conn.execute(
                "UPDATE sessions SET current_conversation_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![conversation_id.to_string(), now.to_rfc3339(), session_id.to_string()],
            )?;
            Ok(Conversation {
                id: conversation_id,
                session_id,
                title: None,
                project_directory,
                created_at: now,
                updated_at: now,
                turn_number: 0,
            })
        })
        .await
    }

    pub async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, role, provider, model, content, tool_calls, tool_call_id, name, created_at
                 FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![conversation_id.to_string()], row_to_message)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn append_user_message(&self, conversation_id: Uuid, content: impl Into<String>) -> Result<Message, StoreError> {
        let content = content.into();
        self.insert_message(conversation_id, Role::User, None, None, content, Vec::new(), None, None).await
    }

    /// Persist a `System`-role message, e.g. a note about a stream-level
    /// failure that interrupted a turn.
    pub async fn append_system_message(&self, conversation_id: Uuid, content: impl Into<String>) -> Result<Message, StoreError> {
        let content = content.into();
        self.insert_message(conversation_id, Role::System, None, None, content, Vec::new(), None, None).await
    }

    pub async fn append_assistant_message(
        &self,
        conversation_id: Uuid,
        provider: impl Into<String>,
        model: impl Into<String>,
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRecord>,
    ) -> Result<Message, StoreError> {
        self.insert_message(
            conversation_id,
            Role::Assistant,
            Some(provider.into()),
            Some(model.into()),
            content.into(),
            tool_calls,
            None,
            None,
        )
        .await
    }

    pub async fn append_tool_result_message(
        &self,
        conversation_id: Uuid,
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Message, StoreError> {
        self.insert_message(
            conversation_id,
            Role::Tool,
            None,
            None,
            content.into(),
            Vec::new(),
            Some(tool_call_id.into()),
            Some(name.into()),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_message(
        &self,
        conversation_id: Uuid,
        role: Role,
        provider: Option<String>,
        model: Option<String>,
        content: String,
        tool_calls: Vec<ToolCallRecord>,
        tool_call_id: Option<String>,
        name: Option<String>,
    ) -> Result<Message, StoreError> {
        debug!(%conversation_id, role = role.as_str(), "append message");
        self.run_blocking(move |conn| {
            let id = Uuid::new_v4();
            let now = Utc::now();
            let tool_calls_json = serde_json::to_string(&tool_calls)
                .map_err(|source| StoreError::Json { column: "tool_calls", source })?;

            let seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), -1) + 1 FROM messages WHERE conversation_id = ?1",
                params![conversation_id.to_string()],
                |row| row.get(0),
            )?;

            conn.execute(
                "INSERT INTO messages (id, conversation_id, role, provider, model, content, tool_calls, tool_call_id, name, created_at, seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    id.to_string(),
                    conversation_id.to_string(),
                    role.as_str(),
                    provider,
                    model,
                    content,
                    tool_calls_json,
                    tool_call_id,
                    name,
                    now.to_rfc3339(),
                    seq,
                ],
            )?;
            conn.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![now.to_rfc3339(), conversation_id.to_string()],
            )?;

            Ok(Message { id, conversation_id, role, provider, model, content, tool_calls, tool_call_id, name, created_at: now })
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_tool_execution(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        tool_call_id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        tool_name: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
        error: impl Into<String>,
        duration_ms: i64,
    ) -> Result<ToolExecution, StoreError> {
        let tool_call_id = tool_call_id.into();
        let provider = provider.into();
        let model = model.into();
        let tool_name = tool_name.into();
        let input = input.into();
        let output = output.into();
        let error = error.into();
        debug!(%conversation_id, tool_name = %tool_name, is_error = !error.is_empty(), "record tool execution");
        self.run_blocking(move |conn| {
            let id = Uuid::new_v4();
            let now = Utc::now();
            conn.execute(
                "INSERT INTO tool_executions
                 (id, conversation_id, message_id, tool_call_id, provider, model, tool_name, input, output, error, duration_ms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    id.to_string(),
                    conversation_id.to_string(),
                    message_id.to_string(),
                    tool_call_id,
                    provider,
                    model,
                    tool_name,
                    input,
                    output,
                    error,
                    duration_ms,
                    now.to_rfc3339(),
                ],
            )?;
            Ok(ToolExecution { id, conversation_id, message_id, tool_call_id, provider, model, tool_name, input, output, error, duration_ms, created_at: now })
        })
        .await
    }
}

fn load_session(conn: &Connection, id: Uuid) -> Result<Option<Session>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, created_at, updated_at, current_conversation_id FROM sessions WHERE id = ?1",
            params![id.to_string()],
            row_to_session_fields,
        )
        .optional()?;
    row.map(|fields| finish_session(conn, fields)).transpose()
}

/// Resolve the `resume` case: the session whose `updated_at` sorts last.
fn load_most_recently_updated_session(conn: &Connection) -> Result<Option<Session>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, created_at, updated_at, current_conversation_id FROM sessions ORDER BY updated_at DESC LIMIT 1",
            [],
            row_to_session_fields,
        )
        .optional()?;
    row.map(|fields| finish_session(conn, fields)).transpose()
}

type SessionFields = (String, String, String, Option<String>);

fn row_to_session_fields(row: &rusqlite::Row) -> rusqlite::Result<SessionFields> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn finish_session(conn: &Connection, (id_str, created_at, updated_at, current_str): SessionFields) -> Result<Session, StoreError> {
    let mut stmt = conn.prepare("SELECT id FROM conversations WHERE session_id = ?1")?;
    let conversation_ids: Vec<Uuid> = stmt
        .query_map(params![id_str], |row| row.get::<_, String>(0))?
        .filter_map(|r| r.ok())
        .filter_map(|s| Uuid::parse_str(&s).ok())
        .collect();

    Ok(Session {
        id: Uuid::parse_str(&id_str).map_err(|_| StoreError::NotFound("session id"))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|_| StoreError::NotFound("session created_at"))?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|_| StoreError::NotFound("session updated_at"))?,
        current_conversation_id: current_str.as_deref().and_then(|s| Uuid::parse_str(s).ok()),
        conversation_ids,
    })
}

fn load_conversation(conn: &Connection, id: Uuid) -> Result<Option<Conversation>, StoreError> {
    conn.query_row(
        "SELECT id, session_id, title, project_directory, turn_number, created_at, updated_at
         FROM conversations WHERE id = ?1",
        params![id.to_string()],
        |row| {
            let id: String = row.get(0)?;
            let session_id: String = row.get(1)?;
            let title: Option<String> = row.get(2)?;
            let project_directory: String = row.get(3)?;
            let turn_number: i64 = row.get(4)?;
            let created_at: String = row.get(5)?;
            let updated_at: String = row.get(6)?;
            Ok((id, session_id, title, project_directory, turn_number, created_at, updated_at))
        },
    )
    .optional()?
    .map(|(id, session_id, title, project_directory, turn_number, created_at, updated_at)| {
        Ok(Conversation {
            id: Uuid::parse_str(&id).map_err(|_| StoreError::NotFound("conversation id"))?,
            session_id: Uuid::parse_str(&session_id).map_err(|_| StoreError::NotFound("conversation session_id"))?,
            title,
            project_directory,
            turn_number: turn_number as u32,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|_| StoreError::NotFound("conversation created_at"))?,
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|_| StoreError::NotFound("conversation updated_at"))?,
        })
    })
    .transpose()
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let role: String = row.get(2)?;
    let provider: Option<String> = row.get(3)?;
    let model: Option<String> = row.get(4)?;
    let content: String = row.get(5)?;
    let tool_calls_json: String = row.get(6)?;
    let tool_call_id: Option<String> = row.get(7)?;
    let name: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;

    let tool_calls: Vec<ToolCallRecord> = serde_json::from_str(&tool_calls_json).unwrap_or_default();

    Ok(Message {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        conversation_id: Uuid::parse_str(&conversation_id).unwrap_or_default(),
        role: Role::parse(&role).unwrap_or(Role::User),
        provider,
        model,
        content,
        tool_calls,
        tool_call_id,
        name,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

use rusqlite::Connection;

use crate::error::StoreError;

/// Each entry is one forward-only `"-- Up"`-delimited migration. There is no
/// down-migration support; adding a new migration means appending to this
/// slice, never editing an existing entry.
const MIGRATIONS: &[&str] = &[
    // version 1
    r#"
-- Up
CREATE TABLE sessions (
    id                      TEXT PRIMARY KEY,
    created_at              TEXT NOT NULL,
    current_conversation_id TEXT NOT NULL
);

CREATE TABLE conversations (
    id          TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL REFERENCES sessions(id),
    created_at  TEXT NOT NULL,
    turn_number INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX idx_conversations_session ON conversations(session_id);

CREATE TABLE messages (
    id              TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    role            TEXT NOT NULL,
    content         TEXT NOT NULL,
    tool_calls      TEXT NOT NULL DEFAULT '[]',
    tool_call_id    TEXT,
    name            TEXT,
    created_at      TEXT NOT NULL,
    seq             INTEGER NOT NULL
);
CREATE INDEX idx_messages_conversation ON messages(conversation_id, seq);

CREATE TABLE tool_executions (
    id              TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    message_id      TEXT NOT NULL REFERENCES messages(id),
    tool_call_id    TEXT NOT NULL,
    tool_name       TEXT NOT NULL,
    arguments       TEXT NOT NULL,
    result          TEXT NOT NULL,
    is_error        INTEGER NOT NULL,
    started_at      TEXT NOT NULL,
    finished_at     TEXT NOT NULL
);
CREATE INDEX idx_tool_executions_conversation ON tool_executions(conversation_id);
"#,
    // version 2: session resumption and the full §3 data model (session
    // updated_at + optional current_conversation_id, conversation
    // title/project_directory/updated_at, message provider/model,
    // tool_execution provider/model/output/error/duration_ms). SQLite
    // can't relax a NOT NULL or drop a column in place, so each table is
    // rebuilt and repopulated from the old one.
    r#"
-- Up
CREATE TABLE sessions_v2 (
    id                      TEXT PRIMARY KEY,
    created_at              TEXT NOT NULL,
    updated_at              TEXT NOT NULL,
    current_conversation_id TEXT
);
INSERT INTO sessions_v2 (id, created_at, updated_at, current_conversation_id)
    SELECT id, created_at, created_at, current_conversation_id FROM sessions;
DROP TABLE sessions;
ALTER TABLE sessions_v2 RENAME TO sessions;

CREATE TABLE conversations_v2 (
    id                TEXT PRIMARY KEY,
    session_id        TEXT NOT NULL REFERENCES sessions(id),
    title             TEXT,
    project_directory TEXT NOT NULL DEFAULT '',
    turn_number       INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);
INSERT INTO conversations_v2 (id, session_id, title, project_directory, turn_number, created_at, updated_at)
    SELECT id, session_id, NULL, '', turn_number, created_at, created_at FROM conversations;
DROP TABLE conversations;
ALTER TABLE conversations_v2 RENAME TO conversations;
CREATE INDEX idx_conversations_session ON conversations(session_id);

CREATE TABLE messages_v2 (
    id              TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    role            TEXT NOT NULL,
    provider        TEXT,
    model           TEXT,
    content         TEXT NOT NULL,
    tool_calls      TEXT NOT NULL DEFAULT '[]',
    tool_call_id    TEXT,
    name            TEXT,
    created_at      TEXT NOT NULL,
    seq             INTEGER NOT NULL
);
INSERT INTO messages_v2 (id, conversation_id, role, provider, model, content, tool_calls, tool_call_id, name, created_at, seq)
    SELECT id, conversation_id, role, NULL, NULL, content, tool_calls, tool_call_id, name, created_at, seq FROM messages;
DROP TABLE messages;
ALTER TABLE messages_v2 RENAME TO messages;
CREATE INDEX idx_messages_conversation ON messages(conversation_id, seq);

CREATE TABLE tool_executions_v2 (
    id              TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    message_id      TEXT NOT NULL REFERENCES messages(id),
    tool_call_id    TEXT NOT NULL,
    provider        TEXT,
    model           TEXT,
    tool_name       TEXT NOT NULL,
    input           TEXT NOT NULL,
    output          TEXT NOT NULL,
    error           TEXT NOT NULL,
    duration_ms     INTEGER NOT NULL,
    created_at      TEXT NOT NULL
);
INSERT INTO tool_executions_v2 (id, conversation_id, message_id, tool_call_id, provider, model, tool_name, input, output, error, duration_ms, created_at)
    SELECT id, conversation_id, message_id, tool_call_id, NULL, NULL, tool_name, arguments,
           CASE WHEN is_error THEN 'Error: ' || result ELSE result END,
           CASE WHEN is_error THEN result ELSE '' END,
           CAST((julianday(finished_at) - julianday(started_at)) * 86400000 AS INTEGER),
           finished_at
    FROM tool_executions;
DROP TABLE tool_executions;
ALTER TABLE tool_executions_v2 RENAME TO tool_executions;
CREATE INDEX idx_tool_executions_conversation ON tool_executions(conversation_id);
"#,
];

pub fn run(conn: &mut Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        )",
    )?;

    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    let known = MIGRATIONS.len() as i64;
    if current > known {
        return Err(StoreError::SchemaTooNew { found: current, known });
    }

    let tx = conn.transaction()?;
    for (idx, migration) in MIGRATIONS.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        tx.execute_batch(migration)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, chrono::Utc::now().to_rfc3339()],
        )?;
    }
    tx.commit()?;
    Ok(())
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage failure: malformed json in {column}: {source}")]
    Json {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("storage failure: schema version {found} is newer than the {known} migrations this binary knows")]
    SchemaTooNew { found: i64, known: i64 },
    #[error("storage failure: {0} not found")]
    NotFound(&'static str),
    #[error("session {0} not found")]
    SessionNotFound(uuid::Uuid),
    #[error("storage failure: task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] turnloop_store::StoreError),
    #[error("model request failed: {0}")]
    Model(String),
    #[error("conversation {0} not found")]
    ConversationNotFound(uuid::Uuid),
}

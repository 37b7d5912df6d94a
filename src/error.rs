use crate::providers::ProviderError;

/// Errors surfaced by the client and runtime APIs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unregistered orchestration: {0}")]
    InvalidOrchestration(String),

    #[error("instance '{0}' not found")]
    NotFound(String),

    #[error("instance '{0}' already exists")]
    AlreadyExists(String),

    #[error("unregistered activity: {0}")]
    ActivityNotFound(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

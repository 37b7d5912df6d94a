/// Classification of a provider failure.
///
/// The runtime branches on the kind: conflicts trigger a re-read and retry of
/// the whole turn, retryable errors abandon the message for redelivery, and
/// permanent errors are logged and surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Stale `expected_seq` on append/commit; another writer won the race.
    Conflict,
    /// Instance (or lock token) does not exist.
    NotFound,
    /// Instance id is already taken.
    AlreadyExists,
    /// Transient failure (busy database, pool timeout).
    Retryable,
    /// Invalid request or corrupt data; retrying will not help.
    Permanent,
}

/// Provider-specific error with the failing operation and a retry classification.
///
/// ```rust
/// use durafan::providers::ProviderError;
///
/// let err = ProviderError::conflict("append", "expected sequence 3, history has 4");
/// assert!(err.is_conflict());
/// assert!(!err.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation}: {message}")]
pub struct ProviderError {
    /// Operation that failed (e.g. "append", "dequeue")
    pub operation: String,
    pub message: String,
    pub kind: ProviderErrorKind,
}

impl ProviderError {
    fn new(kind: ProviderErrorKind, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind,
        }
    }

    pub fn conflict(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Conflict, operation, message)
    }

    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NotFound, operation, message)
    }

    pub fn already_exists(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::AlreadyExists, operation, message)
    }

    /// Transient error that might succeed on retry.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Retryable, operation, message)
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Permanent, operation, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::Retryable
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ProviderErrorKind::Conflict
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }
}

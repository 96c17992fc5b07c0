//! Infrastructure error types shared by stores and engine components.

use regsync_core::DomainError;

pub type StoreResult<T> = Result<T, StoreError>;

/// Store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),
    /// Optimistic version check failed; the caller lost a race and must re-read.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, StoreError::Concurrency(_))
    }

    pub(crate) fn poisoned() -> Self {
        StoreError::Storage("store lock poisoned".to_string())
    }
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Conflict(msg) => StoreError::Concurrency(msg),
            other => StoreError::InvalidState(other.to_string()),
        }
    }
}

/// Unexpected failures inside the engine.
///
/// Expected delivery outcomes (retries, rejections, partial results) are
/// reported as values; this type is reserved for faults that halt a
/// connection.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("engine fault: {0}")]
    Fault(String),
}

impl EngineError {
    pub fn fault(msg: impl Into<String>) -> Self {
        EngineError::Fault(msg.into())
    }
}

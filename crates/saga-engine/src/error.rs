use saga_pool::PoolError;
use saga_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session error: {0}")]
    Session(#[from] StoreError),

    #[error("no agent can handle this request")]
    NoCapableAgent,

    #[error("request {0} was already dispatched")]
    DuplicateRequest(String),

    #[error("transcript could not be saved: {0}")]
    PersistenceFailure(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Session(e) => e.is_retryable(),
            Self::NoCapableAgent | Self::DuplicateRequest(_) | Self::PersistenceFailure(_) => false,
        }
    }

    /// Short classification string for logs, metrics and error frames.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Session(StoreError::Pool(PoolError::Timeout(_))) => "pool_timeout",
            Self::Session(_) => "session_error",
            Self::NoCapableAgent => "no_capable_agent",
            Self::DuplicateRequest(_) => "duplicate_request",
            Self::PersistenceFailure(_) => "persistence_failure",
        }
    }
}

use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("no connection became available within {0:?}")]
    Timeout(Duration),

    #[error("pool is closed")]
    Closed,

    #[error("failed to open connection: {0}")]
    Connect(String),

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// The pool never retries on its own; callers decide.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connect(_))
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "pool_timeout",
            Self::Closed => "pool_closed",
            Self::Connect(_) => "pool_connect",
            Self::InvalidConfig(_) => "pool_config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_retryable() {
        let err = PoolError::Timeout(Duration::from_millis(100));
        assert!(err.is_retryable());
        assert_eq!(err.error_kind(), "pool_timeout");
    }

    #[test]
    fn closed_is_not_retryable() {
        assert!(!PoolError::Closed.is_retryable());
        assert!(!PoolError::InvalidConfig("x".into()).is_retryable());
    }
}

use rusqlite::ErrorCode;
use saga_pool::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The pooled handle is unusable and must not be reused.
    #[error("database connection lost: {0}")]
    ConnectionLost(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("remote session service returned {status}: {body}")]
    Remote { status: u16, body: String },

    /// The request left this process but no answer came back; the remote
    /// side may or may not have applied it.
    #[error("session store outcome unknown: {0}")]
    OutcomeUnknown(String),
}

impl StoreError {
    /// Transient conditions worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::ConnectionLost(_) | Self::OutcomeUnknown(_) => true,
            Self::Pool(e) => e.is_retryable(),
            Self::Remote { status, .. } => *status == 429 || *status >= 500,
            Self::SessionNotFound(_)
            | Self::Database(_)
            | Self::CorruptRow { .. }
            | Self::Serialization(_) => false,
        }
    }

    /// Retryable, and the failed call cannot have changed stored state, so
    /// a write may be sent again without duplicating it.
    pub fn is_resendable(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::ConnectionLost(_) => true,
            Self::Pool(e) => e.is_retryable(),
            Self::Remote { status, .. } => *status == 429,
            Self::OutcomeUnknown(_)
            | Self::SessionNotFound(_)
            | Self::Database(_)
            | Self::CorruptRow { .. }
            | Self::Serialization(_) => false,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::Unavailable(_) | Self::ConnectionLost(_) => "store_unavailable",
            Self::Pool(e) => e.error_kind(),
            Self::Database(_) => "database_error",
            Self::CorruptRow { .. } => "corrupt_row",
            Self::Serialization(_) => "serialization_error",
            Self::Remote { .. } => "remote_error",
            Self::OutcomeUnknown(_) => "store_outcome_unknown",
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                StoreError::Unavailable(e.to_string())
            }
            Some(
                ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase
                | ErrorCode::DatabaseCorrupt,
            ) => StoreError::ConnectionLost(e.to_string()),
            _ => StoreError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return StoreError::Serialization(e.to_string());
        }
        if let Some(status) = e.status() {
            return StoreError::Remote {
                status: status.as_u16(),
                body: e.to_string(),
            };
        }
        if e.is_connect() || e.is_builder() {
            return StoreError::Unavailable(e.to_string());
        }
        StoreError::OutcomeUnknown(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pool_timeout_is_retryable() {
        let err: StoreError = PoolError::Timeout(Duration::from_millis(100)).into();
        assert!(err.is_retryable());
        assert_eq!(err.error_kind(), "pool_timeout");
    }

    #[test]
    fn not_found_is_final() {
        let err = StoreError::SessionNotFound("s1".into());
        assert!(!err.is_retryable());
        assert_eq!(err.error_kind(), "session_not_found");
    }

    #[test]
    fn remote_status_classification() {
        assert!(StoreError::Remote { status: 503, body: String::new() }.is_retryable());
        assert!(StoreError::Remote { status: 429, body: String::new() }.is_retryable());
        assert!(!StoreError::Remote { status: 400, body: String::new() }.is_retryable());
    }

    #[test]
    fn only_unsent_writes_are_resendable() {
        let timeout: StoreError = PoolError::Timeout(Duration::from_millis(100)).into();
        assert!(timeout.is_resendable());
        assert!(StoreError::Unavailable("refused".into()).is_resendable());
        assert!(StoreError::Remote { status: 429, body: String::new() }.is_resendable());

        let gateway = StoreError::Remote { status: 504, body: String::new() };
        assert!(gateway.is_retryable());
        assert!(!gateway.is_resendable());
        let lost = StoreError::OutcomeUnknown("timed out".into());
        assert!(lost.is_retryable());
        assert!(!lost.is_resendable());
        assert!(!StoreError::SessionNotFound("s".into()).is_resendable());
    }

    #[test]
    fn busy_sqlite_maps_to_unavailable() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(StoreError::from(err), StoreError::Unavailable(_)));
    }

    #[test]
    fn other_sqlite_errors_are_database_errors() {
        let err = StoreError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, StoreError::Database(_)));
        assert!(!err.is_retryable());
    }
}

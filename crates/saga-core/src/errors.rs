use std::time::Duration;

/// Failure of a single agent's stream. Isolated to that agent within a
/// dispatch batch.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent failed: {0}")]
    Failed(String),
    #[error("agent unavailable: {0}")]
    Unavailable(String),
    #[error("generator returned status {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("agent exceeded generation limit of {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Upstream { status, .. } => *status == 429 || *status >= 500,
            Self::Failed(_) | Self::Timeout(_) | Self::Cancelled => false,
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "agent_failed",
            Self::Unavailable(_) => "agent_unavailable",
            Self::Upstream { .. } => "upstream_error",
            Self::Timeout(_) => "agent_timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

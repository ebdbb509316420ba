use async_trait::async_trait;

use crate::error::PoolError;

/// Health of a pooled handle as last observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// Suspect; must pass a probe before it is handed out again.
    Degraded,
    /// Disposed on release and replaced up to the minimum size.
    Dead,
}

/// Opens and checks backend handles for a [`Pool`](crate::Pool).
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection, PoolError>;

    /// Cheap liveness check. `false` means the handle is unusable.
    async fn probe(&self, conn: &mut Self::Connection) -> bool;
}

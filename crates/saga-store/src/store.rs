use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use saga_core::settings::Settings;
use saga_core::{Message, NewMessage, Session, SessionId, StoreMode};
use saga_pool::{PoolConfig, PoolMetrics};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::active::SessionHold;
use crate::ephemeral::EphemeralStore;
use crate::error::StoreError;
use crate::remote::RemoteStore;
use crate::sqlite::SqliteStore;

/// Liveness report for the health endpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoreHealth {
    pub mode: StoreMode,
    pub live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolMetrics>,
}

impl StoreHealth {
    pub fn live(mode: StoreMode) -> Self {
        Self {
            mode,
            live: true,
            detail: None,
            pool: None,
        }
    }

    pub fn down(mode: StoreMode, detail: impl Into<String>) -> Self {
        Self {
            mode,
            live: false,
            detail: Some(detail.into()),
            pool: None,
        }
    }
}

/// Uniform session storage contract. Callers never branch on the backend.
///
/// Sequence numbers start at 1 and are assigned at append time, so they are
/// strictly increasing and gapless per session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    fn mode(&self) -> StoreMode;

    /// Idempotent: a second call returns the same session without
    /// touching its history.
    async fn get_or_create(&self, id: &SessionId) -> Result<Session, StoreError>;

    /// Append one message to an existing session.
    async fn append(&self, id: &SessionId, message: NewMessage) -> Result<Message, StoreError> {
        let mut appended = self.append_batch(id, vec![message]).await?;
        appended
            .pop()
            .ok_or_else(|| StoreError::Database("append returned no message".into()))
    }

    /// Append several messages with consecutive sequence numbers in one
    /// atomic step.
    async fn append_batch(
        &self,
        id: &SessionId,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<Message>, StoreError>;

    /// The last `limit` messages (all when `None`), oldest first.
    async fn history(&self, id: &SessionId, limit: Option<usize>)
        -> Result<Vec<Message>, StoreError>;

    /// Remove a session and its history. Returns whether it existed.
    async fn close(&self, id: &SessionId) -> Result<bool, StoreError>;

    /// Keep `id` out of idle reaping until the hold is dropped.
    fn hold(&self, id: &SessionId) -> SessionHold {
        SessionHold::detached(id)
    }

    /// Drop sessions inactive for longer than `max_idle`, except held ones.
    async fn reap_idle(&self, max_idle: Duration) -> Result<usize, StoreError>;

    async fn health(&self) -> StoreHealth;

    fn pool_metrics(&self) -> Option<PoolMetrics> {
        None
    }

    /// Release backend resources. Further calls fail.
    async fn shutdown(&self) {}
}

/// Build the store selected by `settings.store.mode`. The only place that
/// branches on the backend.
pub async fn open_store(settings: &Settings) -> Result<Arc<dyn SessionStore>, StoreError> {
    let store: Arc<dyn SessionStore> = match settings.store.mode {
        StoreMode::Ephemeral => Arc::new(EphemeralStore::new()),
        StoreMode::PersistentPooled => {
            let store = SqliteStore::open(
                std::path::Path::new(&settings.store.database_path),
                PoolConfig::from(&settings.pool),
            )
            .await?;
            store.spawn_health_sweep();
            Arc::new(store)
        }
        StoreMode::ManagedRemote => {
            let url = settings.store.remote_url.as_deref().ok_or_else(|| {
                StoreError::Unavailable("managed-remote mode needs store.remote_url".into())
            })?;
            Arc::new(RemoteStore::new(url, settings.store.remote_timeout())?)
        }
    };
    info!(mode = %store.mode(), "session store ready");
    Ok(store)
}

/// Reap idle sessions every `interval` until `shutdown` fires.
pub fn spawn_idle_reaper(
    store: Arc<dyn SessionStore>,
    interval: Duration,
    max_idle: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => match store.reap_idle(max_idle).await {
                    Ok(0) => {}
                    Ok(n) => info!(reaped = n, mode = %store.mode(), "reaped idle sessions"),
                    Err(e) => warn!(error = %e, "idle session reap failed"),
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_store_defaults_to_ephemeral() {
        let store = open_store(&Settings::default()).await.unwrap();
        assert_eq!(store.mode(), StoreMode::Ephemeral);
        assert!(store.health().await.live);
        assert!(store.pool_metrics().is_none());
    }

    #[tokio::test]
    async fn open_store_persistent_uses_pool() {
        let dir = std::env::temp_dir().join(format!("saga-open-store-{}", uuid::Uuid::now_v7()));
        let mut settings = Settings::default();
        settings.store.mode = StoreMode::PersistentPooled;
        settings.store.database_path = dir.join("sessions.db").to_string_lossy().into_owned();
        settings.pool.min_size = 1;
        settings.pool.max_size = 2;

        let store = open_store(&settings).await.unwrap();
        assert_eq!(store.mode(), StoreMode::PersistentPooled);
        let metrics = store.pool_metrics().unwrap();
        assert_eq!(metrics.max_size, 2);
        assert!(metrics.total >= 1);
        store.shutdown().await;
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn open_store_remote_requires_url() {
        let mut settings = Settings::default();
        settings.store.mode = StoreMode::ManagedRemote;
        assert!(matches!(
            open_store(&settings).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_removes_idle_sessions_until_cancelled() {
        let store: Arc<dyn SessionStore> = Arc::new(EphemeralStore::new());
        let _ = store.get_or_create(&SessionId::from_raw("old")).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = spawn_idle_reaper(
            Arc::clone(&store),
            Duration::from_millis(10),
            Duration::ZERO,
            shutdown.clone(),
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(matches!(
            store.history(&SessionId::from_raw("old"), None).await,
            Err(StoreError::SessionNotFound(_))
        ));

        shutdown.cancel();
        handle.await.unwrap();
    }
}

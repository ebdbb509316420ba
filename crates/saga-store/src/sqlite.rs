use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use saga_core::{Message, NewMessage, Session, SessionId, StoreMode};
use saga_pool::{Lease, Manager, Pool, PoolConfig, PoolError, PoolMetrics};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::active::{ActiveSessions, SessionHold};
use crate::error::StoreError;
use crate::row_helpers::{self, format_timestamp};
use crate::schema;
use crate::store::{SessionStore, StoreHealth};

/// Opens SQLite connections for the pool.
pub struct SqliteManager {
    path: PathBuf,
}

impl SqliteManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Manager for SqliteManager {
    type Connection = Connection;

    async fn connect(&self) -> Result<Connection, PoolError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path).map_err(|e| PoolError::Connect(e.to_string()))?;
            conn.execute_batch(schema::PRAGMAS)
                .map_err(|e| PoolError::Connect(format!("pragmas: {e}")))?;
            Ok(conn)
        })
        .await
        .map_err(|e| PoolError::Connect(format!("connect task failed: {e}")))?
    }

    async fn probe(&self, conn: &mut Connection) -> bool {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}

/// Durable sessions in SQLite. Every operation holds one pooled
/// connection for its duration.
pub struct SqliteStore {
    pool: Pool<SqliteManager>,
    sweep: parking_lot::Mutex<Option<JoinHandle<()>>>,
    active: ActiveSessions,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and warm the pool.
    pub async fn open(path: &Path, config: PoolConfig) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("create dir: {e}")))?;
        }
        let pool = Pool::open(SqliteManager::new(path), config).await?;
        let store = Self {
            pool,
            sweep: parking_lot::Mutex::new(None),
            active: ActiveSessions::new(),
        };
        store
            .with_conn(|conn| {
                conn.execute_batch(schema::CREATE_TABLES)?;
                let version: Option<u32> = conn
                    .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                        row.get(0)
                    })
                    .optional()?;
                if version.is_none() {
                    conn.execute(
                        "INSERT INTO schema_version (version) VALUES (?1)",
                        [schema::SCHEMA_VERSION],
                    )?;
                }
                Ok(())
            })
            .await?;
        info!(path = %path.display(), "session database opened");
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<SqliteManager> {
        &self.pool
    }

    /// Start the pool's background health sweep.
    pub fn spawn_health_sweep(&self) {
        let handle = self.pool.spawn_health_sweep();
        if let Some(previous) = self.sweep.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Run `f` on a pooled connection off the async threads. A connection
    /// that fails hard is marked dead so the pool replaces it.
    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let lease: Lease<SqliteManager> = self.pool.get().await?;
        tokio::task::spawn_blocking(move || {
            let mut lease = lease;
            let result = f(&mut lease);
            if let Err(StoreError::ConnectionLost(detail)) = &result {
                warn!(entry = lease.id(), detail = %detail, "discarding broken connection");
                lease.mark_dead();
            }
            result
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("database task failed: {e}")))?
    }
}

fn load_session(conn: &Connection, id: &str) -> Result<Option<Session>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT s.id, s.mode, s.created_at, s.last_active_at,
                (SELECT COALESCE(MAX(m.sequence), 0) FROM messages m WHERE m.session_id = s.id)
         FROM sessions s WHERE s.id = ?1",
    )?;
    let mut rows = stmt.query([id])?;
    match rows.next()? {
        Some(row) => row_to_session(row).map(Some),
        None => Ok(None),
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let id: String = row_helpers::get(row, 0, "sessions", "id")?;
    let mode: String = row_helpers::get(row, 1, "sessions", "mode")?;
    let created_at: String = row_helpers::get(row, 2, "sessions", "created_at")?;
    let last_active_at: String = row_helpers::get(row, 3, "sessions", "last_active_at")?;
    let count: i64 = row_helpers::get(row, 4, "sessions", "message_count")?;
    Ok(Session {
        id: SessionId::from_raw(id),
        mode: row_helpers::parse_enum(&mode, "sessions", "mode")?,
        created_at: row_helpers::parse_timestamp(&created_at, "sessions", "created_at")?,
        last_active_at: row_helpers::parse_timestamp(
            &last_active_at,
            "sessions",
            "last_active_at",
        )?,
        message_count: count as u64,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let sequence: i64 = row_helpers::get(row, 0, "messages", "sequence")?;
    let role: String = row_helpers::get(row, 1, "messages", "role")?;
    let agent_name: Option<String> = row_helpers::get_opt(row, 2, "messages", "agent_name")?;
    let content: String = row_helpers::get(row, 3, "messages", "content")?;
    let status: String = row_helpers::get(row, 4, "messages", "status")?;
    let timestamp: String = row_helpers::get(row, 5, "messages", "timestamp")?;
    Ok(Message {
        role: row_helpers::parse_enum(&role, "messages", "role")?,
        agent_name,
        content: row_helpers::parse_json(&content, "messages", "content")?,
        status: row_helpers::parse_enum(&status, "messages", "status")?,
        sequence: sequence as u64,
        timestamp: row_helpers::parse_timestamp(&timestamp, "messages", "timestamp")?,
    })
}

fn session_exists(conn: &Connection, id: &str) -> Result<bool, StoreError> {
    Ok(conn
        .query_row("SELECT 1 FROM sessions WHERE id = ?1", [id], |_| Ok(()))
        .optional()?
        .is_some())
}

#[async_trait]
impl SessionStore for SqliteStore {
    fn mode(&self) -> StoreMode {
        StoreMode::PersistentPooled
    }

    #[instrument(skip(self), fields(session_id = %id))]
    async fn get_or_create(&self, id: &SessionId) -> Result<Session, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let now = format_timestamp(&Utc::now());
            conn.execute(
                "INSERT INTO sessions (id, mode, created_at, last_active_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(id) DO UPDATE SET last_active_at = excluded.last_active_at",
                rusqlite::params![id.as_str(), StoreMode::PersistentPooled.as_str(), now],
            )?;
            load_session(conn, id.as_str())?
                .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))
        })
        .await
    }

    #[instrument(skip(self, messages), fields(session_id = %id, count = messages.len()))]
    async fn append_batch(
        &self,
        id: &SessionId,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<Message>, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            // IMMEDIATE takes the write lock before reading the last
            // sequence, so concurrent appenders cannot interleave.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if !session_exists(&tx, id.as_str())? {
                return Err(StoreError::SessionNotFound(id.to_string()));
            }
            let last: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM messages WHERE session_id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )?;
            let now = Utc::now();
            let stamp = format_timestamp(&now);
            let mut appended = Vec::with_capacity(messages.len());
            {
                let mut insert = tx.prepare_cached(
                    "INSERT INTO messages (session_id, sequence, role, agent_name, content, status, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for (offset, message) in messages.into_iter().enumerate() {
                    let sequence = last as u64 + offset as u64 + 1;
                    let content = serde_json::to_string(&message.content)?;
                    let _ = insert.execute(rusqlite::params![
                        id.as_str(),
                        sequence as i64,
                        message.role.to_string(),
                        message.agent_name.as_deref(),
                        content,
                        message.status.to_string(),
                        stamp,
                    ])?;
                    appended.push(message.into_message(sequence, now));
                }
            }
            let _ = tx.execute(
                "UPDATE sessions SET last_active_at = ?1 WHERE id = ?2",
                rusqlite::params![stamp, id.as_str()],
            )?;
            tx.commit()?;
            Ok(appended)
        })
        .await
    }

    #[instrument(skip(self), fields(session_id = %id))]
    async fn history(
        &self,
        id: &SessionId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            if !session_exists(conn, id.as_str())? {
                return Err(StoreError::SessionNotFound(id.to_string()));
            }
            // LIMIT -1 means no limit in SQLite.
            let limit = limit.map_or(-1, |n| n as i64);
            let mut stmt = conn.prepare_cached(
                "SELECT sequence, role, agent_name, content, status, timestamp
                 FROM messages WHERE session_id = ?1
                 ORDER BY sequence DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![id.as_str(), limit])?;
            let mut messages = Vec::new();
            while let Some(row) = rows.next()? {
                messages.push(row_to_message(row)?);
            }
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    #[instrument(skip(self), fields(session_id = %id))]
    async fn close(&self, id: &SessionId) -> Result<bool, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            Ok(removed > 0)
        })
        .await
    }

    fn hold(&self, id: &SessionId) -> SessionHold {
        self.active.hold(id)
    }

    async fn reap_idle(&self, max_idle: Duration) -> Result<usize, StoreError> {
        let max_idle = chrono::Duration::from_std(max_idle)
            .map_err(|e| StoreError::Database(format!("idle window out of range: {e}")))?;
        let cutoff = format_timestamp(&(Utc::now() - max_idle));
        let held: Vec<String> = self
            .active
            .ids()
            .into_iter()
            .map(|id| id.as_str().to_string())
            .collect();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let idle: Vec<String> = {
                let mut stmt = tx.prepare("SELECT id FROM sessions WHERE last_active_at <= ?1")?;
                let rows = stmt.query_map([&cutoff], |row| row.get::<_, String>(0))?;
                rows.collect::<Result<_, _>>()?
            };
            let mut removed = 0;
            for id in idle.iter().filter(|id| !held.contains(id)) {
                removed += tx.execute("DELETE FROM sessions WHERE id = ?1", [id])?;
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn health(&self) -> StoreHealth {
        let probe = self
            .with_conn(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                Ok(())
            })
            .await;
        let mut health = match probe {
            Ok(()) => StoreHealth::live(StoreMode::PersistentPooled),
            Err(e) => StoreHealth::down(StoreMode::PersistentPooled, e.to_string()),
        };
        health.pool = Some(self.pool.metrics());
        health
    }

    fn pool_metrics(&self) -> Option<PoolMetrics> {
        Some(self.pool.metrics())
    }

    async fn shutdown(&self) {
        self.pool.close();
        if let Some(handle) = self.sweep.lock().take() {
            handle.abort();
        }
    }
}

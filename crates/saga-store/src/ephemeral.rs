use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use saga_core::{Message, NewMessage, Session, SessionId, StoreMode};
use tracing::instrument;

use crate::active::{ActiveSessions, SessionHold};
use crate::error::StoreError;
use crate::store::{SessionStore, StoreHealth};

struct MemorySession {
    session: Session,
    messages: Vec<Message>,
}

/// Sessions in process memory. Lost on restart.
#[derive(Default)]
pub struct EphemeralStore {
    sessions: DashMap<SessionId, MemorySession>,
    active: ActiveSessions,
}

impl EphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for EphemeralStore {
    fn mode(&self) -> StoreMode {
        StoreMode::Ephemeral
    }

    #[instrument(skip(self), fields(session_id = %id))]
    async fn get_or_create(&self, id: &SessionId) -> Result<Session, StoreError> {
        let now = Utc::now();
        let mut entry = self
            .sessions
            .entry(id.clone())
            .or_insert_with(|| MemorySession {
                session: Session {
                    id: id.clone(),
                    mode: StoreMode::Ephemeral,
                    created_at: now,
                    last_active_at: now,
                    message_count: 0,
                },
                messages: Vec::new(),
            });
        entry.session.last_active_at = now;
        Ok(entry.session.clone())
    }

    #[instrument(skip(self, messages), fields(session_id = %id, count = messages.len()))]
    async fn append_batch(
        &self,
        id: &SessionId,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<Message>, StoreError> {
        // The shard write lock makes numbering and insertion one step.
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
        let now = Utc::now();
        let mut appended = Vec::with_capacity(messages.len());
        for message in messages {
            let sequence = entry.session.message_count + 1;
            let stored = message.into_message(sequence, now);
            entry.messages.push(stored.clone());
            entry.session.message_count = sequence;
            appended.push(stored);
        }
        entry.session.last_active_at = now;
        Ok(appended)
    }

    #[instrument(skip(self), fields(session_id = %id))]
    async fn history(
        &self,
        id: &SessionId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, StoreError> {
        let entry = self
            .sessions
            .get(id)
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
        let messages = &entry.messages;
        let start = limit.map_or(0, |n| messages.len().saturating_sub(n));
        Ok(messages[start..].to_vec())
    }

    async fn close(&self, id: &SessionId) -> Result<bool, StoreError> {
        Ok(self.sessions.remove(id).is_some())
    }

    fn hold(&self, id: &SessionId) -> SessionHold {
        self.active.hold(id)
    }

    async fn reap_idle(&self, max_idle: Duration) -> Result<usize, StoreError> {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|id, s| {
            let idle = (now - s.session.last_active_at).to_std().unwrap_or_default();
            idle < max_idle || self.active.is_active(id)
        });
        Ok(before.saturating_sub(self.sessions.len()))
    }

    async fn health(&self) -> StoreHealth {
        StoreHealth::live(StoreMode::Ephemeral)
    }
}

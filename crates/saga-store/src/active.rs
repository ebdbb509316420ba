use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use saga_core::SessionId;

/// Sessions with work in flight. Idle reaping leaves them alone.
#[derive(Clone, Debug, Default)]
pub struct ActiveSessions {
    holds: Arc<DashMap<SessionId, usize>>,
}

impl ActiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&self, id: &SessionId) -> SessionHold {
        *self.holds.entry(id.clone()).or_insert(0) += 1;
        SessionHold {
            active: Some(self.clone()),
            id: id.clone(),
        }
    }

    pub fn is_active(&self, id: &SessionId) -> bool {
        self.holds.contains_key(id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.holds.iter().map(|e| e.key().clone()).collect()
    }

    fn release(&self, id: &SessionId) {
        if let Entry::Occupied(mut held) = self.holds.entry(id.clone()) {
            if *held.get() <= 1 {
                held.remove();
            } else {
                *held.get_mut() -= 1;
            }
        }
    }
}

/// Keeps one session out of idle reaping until dropped.
#[derive(Debug)]
pub struct SessionHold {
    active: Option<ActiveSessions>,
    id: SessionId,
}

impl SessionHold {
    /// For backends that never reap locally.
    pub fn detached(id: &SessionId) -> Self {
        Self {
            active: None,
            id: id.clone(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.id
    }
}

impl Drop for SessionHold {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.release(&self.id);
        }
    }
}

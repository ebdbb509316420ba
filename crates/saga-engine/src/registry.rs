use std::sync::Arc;

use parking_lot::RwLock;
use saga_core::settings::TieBreak;
use saga_core::{AgentKind, AgentRequest, Capability};
use serde::Serialize;
use tracing::debug;

use crate::classify;
use crate::error::EngineError;

struct AgentEntry {
    name: String,
    capability: Arc<dyn Capability>,
}

/// An agent chosen for one request.
#[derive(Clone)]
pub struct ResolvedAgent {
    pub name: String,
    pub capability: Arc<dyn Capability>,
}

impl std::fmt::Debug for ResolvedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedAgent")
            .field("name", &self.name)
            .field("kind", &self.capability.kind())
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AgentInfo {
    pub name: String,
    pub kind: AgentKind,
}

/// Named agents in registration order.
///
/// Writes happen at startup or during reconfiguration; every dispatch reads a
/// snapshot so registration changes never block or tear an in-flight request.
pub struct AgentRegistry {
    entries: RwLock<Vec<AgentEntry>>,
    tie_break: TieBreak,
}

impl AgentRegistry {
    pub fn new(tie_break: TieBreak) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            tie_break,
        }
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Register an agent. Re-registering a name replaces the capability but
    /// keeps its original position.
    pub fn register(&self, name: impl Into<String>, capability: Arc<dyn Capability>) {
        let name = name.into();
        let mut entries = self.entries.write();
        if let Some(existing) = entries.iter_mut().find(|e| e.name == name) {
            debug!(agent = %name, "replacing registered agent");
            existing.capability = capability;
        } else {
            debug!(agent = %name, kind = %capability.kind(), "registered agent");
            entries.push(AgentEntry { name, capability });
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.name != name);
        entries.len() != before
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.name == name)
            .map(|e| Arc::clone(&e.capability))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().iter().any(|e| e.name == name)
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().iter().map(|e| e.name.clone()).collect()
    }

    pub fn describe(&self) -> Vec<AgentInfo> {
        self.entries
            .read()
            .iter()
            .map(|e| AgentInfo {
                name: e.name.clone(),
                kind: e.capability.kind(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn snapshot(&self) -> Vec<ResolvedAgent> {
        self.entries
            .read()
            .iter()
            .map(|e| ResolvedAgent {
                name: e.name.clone(),
                capability: Arc::clone(&e.capability),
            })
            .collect()
    }

    /// Pick the agents for a request.
    ///
    /// A registered `requested_agent` wins outright. Otherwise every agent
    /// whose `accepts` returns true is a candidate: composite requests run
    /// all candidates in kind priority order, anything else runs the one
    /// candidate picked by the tie-break rule.
    pub fn resolve(&self, request: &AgentRequest) -> Result<Vec<ResolvedAgent>, EngineError> {
        let agents = self.snapshot();

        if let Some(wanted) = request.requested_agent.as_deref() {
            if let Some(agent) = agents.iter().find(|a| a.name == wanted) {
                return Ok(vec![agent.clone()]);
            }
            debug!(agent = wanted, "requested agent not registered, classifying instead");
        }

        let mut candidates: Vec<ResolvedAgent> = agents
            .into_iter()
            .filter(|a| a.capability.accepts(request))
            .collect();
        if candidates.is_empty() {
            return Err(EngineError::NoCapableAgent);
        }

        if classify::is_composite(request) {
            // Stable sort keeps registration order within a kind.
            candidates.sort_by_key(|a| a.capability.kind().priority());
            return Ok(candidates);
        }

        let chosen = match self.tie_break {
            TieBreak::RegistrationOrder => candidates.swap_remove(0),
            TieBreak::KindPriority => {
                let idx = candidates
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, a)| a.capability.kind().priority())
                    .map_or(0, |(i, _)| i);
                candidates.swap_remove(idx)
            }
        };
        Ok(vec![chosen])
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(TieBreak::default())
    }
}

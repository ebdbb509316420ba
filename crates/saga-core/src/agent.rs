use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::messages::Message;
use crate::request::AgentRequest;

/// Ordered, finite stream of partial results for one agent invocation.
/// An `Err` item ends the agent's contribution as partial.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, AgentError>> + Send>>;

/// Artifact family an agent produces. The declaration order is the
/// composite-batch priority: later kinds may reference earlier outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Plot,
    Author,
    World,
    Characters,
    Enhancement,
    Other,
}

impl AgentKind {
    /// Lower runs first in a composite batch.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Plot => 0,
            Self::Author => 1,
            Self::World => 2,
            Self::Characters => 3,
            Self::Enhancement => 4,
            Self::Other => 5,
        }
    }

    /// Kinds that count as distinct artifacts when detecting composite intent.
    pub fn artifact_kinds() -> [AgentKind; 4] {
        [Self::Plot, Self::Author, Self::World, Self::Characters]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plot => "plot",
            Self::Author => "author",
            Self::World => "world",
            Self::Characters => "characters",
            Self::Enhancement => "enhancement",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform contract every registered agent exposes. Generation logic is
/// opaque to the orchestrator.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> AgentKind;
    fn accepts(&self, request: &AgentRequest) -> bool;

    /// Start streaming. `history` is the session history, most recent last,
    /// followed by provisional outputs of earlier agents in the same batch.
    async fn stream(
        &self,
        request: &AgentRequest,
        history: &[Message],
    ) -> Result<ChunkStream, AgentError>;
}

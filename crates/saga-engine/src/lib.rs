//! Agent registry, request classification and the dispatch router.

pub mod agents;
pub mod classify;
pub mod error;
pub mod mock;
pub mod registry;
pub mod retry;
pub mod router;
pub mod sink;

pub use agents::{default_agents, GenerationPrompt, Generator, HttpGenerator, KeywordAgent, PromptTurn};
pub use error::EngineError;
pub use registry::{AgentInfo, AgentRegistry, ResolvedAgent};
pub use retry::Backoff;
pub use router::{AgentOutcome, DispatchOutcome, DispatchState, Router, RouterConfig};
pub use sink::{ChannelSink, StreamSink};

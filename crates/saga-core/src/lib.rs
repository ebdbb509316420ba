pub mod agent;
pub mod errors;
pub mod frames;
pub mod ids;
pub mod messages;
pub mod request;
pub mod settings;

pub use agent::{AgentKind, Capability, ChunkStream};
pub use errors::AgentError;
pub use frames::{FrameType, OutboundFrame};
pub use ids::{RequestId, SessionId};
pub use messages::{Content, Message, MessageStatus, NewMessage, Role, Session, StoreMode};
pub use request::AgentRequest;
pub use settings::Settings;

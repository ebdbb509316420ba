pub mod connection;
pub mod handlers;
pub mod server;

pub use connection::{ConnectionId, ConnectionRegistry, InboundFrame};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};

//! Session storage behind one interface with three interchangeable
//! backends: process memory, SQLite over the connection pool, and a
//! managed remote session service.

pub mod active;
pub mod ephemeral;
pub mod error;
pub mod remote;
pub mod row_helpers;
pub mod schema;
pub mod sqlite;
pub mod store;

pub use active::{ActiveSessions, SessionHold};
pub use ephemeral::EphemeralStore;
pub use error::StoreError;
pub use remote::RemoteStore;
pub use sqlite::{SqliteManager, SqliteStore};
pub use store::{open_store, spawn_idle_reaper, SessionStore, StoreHealth};

//! Bounded, health-aware pool of reusable backend handles.
//!
//! Callers never see pool entries directly: [`Pool::acquire`] hands out a
//! [`Lease`] that returns the handle to the idle set (or disposes it, if it
//! was marked dead) when dropped.

mod error;
mod manager;
mod pool;

pub use error::PoolError;
pub use manager::{Health, Manager};
pub use pool::{Lease, Pool, PoolConfig, PoolMetrics, SweepReport};

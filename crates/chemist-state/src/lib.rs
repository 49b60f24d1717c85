//! chemist-state — the authoritative in-memory model of the monitored fleet.
//!
//! The [`Repository`] holds flasks, targets, assignments, telemetry keys, and
//! the recent lifecycle event ring. It is the single serialization point for
//! fleet mutations; every other subsystem reads and writes through it.

pub mod error;
pub mod repository;
pub mod types;

pub use error::{StateError, StateResult};
pub use repository::Repository;
pub use types::*;

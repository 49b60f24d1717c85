//! chemist-investigator — bounded-retry health probing of suspect flasks.
//!
//! Suspicions arrive from the telemetry error channel and from failed
//! distribute calls. A suspect flask is probed with exponential back-off;
//! recovery returns it to Active, exhaustion synthesizes a Terminate event
//! that reuses the lifecycle rebalancing path.

pub mod investigator;
pub mod probe;

pub use investigator::{Investigator, InvestigatorConfig};
pub use probe::{probe_flask, ProbeResult};

//! chemist-metrics — process-wide event counters.
//!
//! Counters are created once at bootstrap, shared via `Arc`, and exposed on
//! the admin HTTP server in Prometheus text exposition format.

pub mod counters;

pub use counters::ControlMetrics;

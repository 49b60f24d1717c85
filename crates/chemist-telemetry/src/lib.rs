//! chemist-telemetry — the flask telemetry stream.
//!
//! [`wire`] is the byte-exact frame and payload codec; [`subscriber`] is the
//! long-lived fan-in that keeps one reader per Active flask, records newly
//! discovered keys, and surfaces liveness errors to the investigator.

pub mod subscriber;
pub mod wire;

pub use subscriber::{NewKey, Subscriber};
pub use wire::{DecodeError, DecodeResult, Frame, Telemetry};

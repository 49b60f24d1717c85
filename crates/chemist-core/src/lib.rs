//! chemist-core — configuration for the chemist control plane.

pub mod config;
pub mod duration;

pub use config::{ChemistConfig, FlaskSeed, InstanceSeed, LocationConfig, NetworkConfig, StrategyKind};
pub use duration::parse_duration;

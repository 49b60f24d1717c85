//! chemist-sharding — placement of targets onto flasks.
//!
//! The strategies are pure functions over a [`chemist_state::ShardSnapshot`];
//! the [`Distributor`] pushes the resulting deltas to the flasks over HTTP.

pub mod distributor;
pub mod error;
pub mod strategy;
pub mod worker;

pub use distributor::Distributor;
pub use error::{ShardingError, ShardingResult};
pub use strategy::{LeastLoadedSharder, RandomSharder, ShardingStrategy};
pub use worker::spawn_distribute_workers;

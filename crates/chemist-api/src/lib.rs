//! chemist-api — the admin HTTP façade.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/shards` | Current assignment plus the unassigned pool |
//! | POST | `/distribute` | Assign the unassigned pool and push the delta |
//! | GET | `/events` | Recent lifecycle events |
//! | POST | `/events` | Inject a lifecycle message (local mode / operators) |
//! | GET | `/flasks` | Fleet listing with states |
//! | GET | `/metrics` | Prometheus exposition of the control counters |

pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::mpsc;

use chemist_lifecycle::InMemoryQueue;
use chemist_metrics::ControlMetrics;
use chemist_sharding::ShardingStrategy;
use chemist_state::{Distribution, Repository};

/// Shared state for the admin handlers.
#[derive(Clone)]
pub struct ApiState {
    pub repo: Arc<Repository>,
    pub strategy: Arc<dyn ShardingStrategy>,
    pub distribute_tx: mpsc::Sender<Distribution>,
    pub metrics: Arc<ControlMetrics>,
    /// Present when the deployment consumes an in-process queue, enabling
    /// `POST /events` injection.
    pub queue: Option<InMemoryQueue>,
}

/// Build the admin router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/shards", get(handlers::list_shards))
        .route("/distribute", post(handlers::force_distribute))
        .route(
            "/events",
            get(handlers::list_events).post(handlers::inject_event),
        )
        .route("/flasks", get(handlers::list_flasks))
        .route("/metrics", get(handlers::prometheus_metrics))
        .with_state(state)
}

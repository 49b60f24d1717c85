//! Distribute worker pool.
//!
//! Redistribution deltas arrive on a bounded channel and are pushed to
//! flasks by a bounded number of concurrent jobs. Errors are logged and
//! never stop the loop.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chemist_metrics::ControlMetrics;
use chemist_state::Distribution;

use crate::distributor::Distributor;

const CHANNEL_CAPACITY: usize = 1024;

/// Spawn the distribute loop. Returns the job sender and the loop handle.
pub fn spawn_distribute_workers(
    distributor: Arc<Distributor>,
    metrics: Arc<ControlMetrics>,
    concurrency: usize,
    shutdown: watch::Receiver<bool>,
) -> (mpsc::Sender<Distribution>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = tokio::spawn(run_distribute_loop(
        rx,
        distributor,
        metrics,
        concurrency,
        shutdown,
    ));
    (tx, handle)
}

async fn run_distribute_loop(
    mut rx: mpsc::Receiver<Distribution>,
    distributor: Arc<Distributor>,
    metrics: Arc<ControlMetrics>,
    concurrency: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("distribute loop shutting down");
                break;
            }
            job = rx.recv() => {
                let Some(delta) = job else { break };
                metrics.record_resharding();

                if delta.is_empty() {
                    debug!("empty delta, no capacity to push to");
                    continue;
                }

                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let distributor = distributor.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = distributor.distribute(&delta).await {
                        warn!(error = %e, "distribute job failed");
                    }
                });
            }
        }
    }
}

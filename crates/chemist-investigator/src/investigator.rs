//! Investigation of suspect flasks.
//!
//! One task per flask under investigation. Probe delays follow
//! `min(cap, base · 2^i) · (1 + U(−0.25, 0.25))`. A single successful probe
//! ends the investigation; exhausting every retry synthesizes a Terminate
//! event for the lifecycle interpreter.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use chemist_metrics::ControlMetrics;
use chemist_state::{EventKind, Flask, FlaskId, FlaskState, LifecycleEvent, Names, Repository};

use crate::probe::probe_flask;

#[derive(Debug, Clone)]
pub struct InvestigatorConfig {
    /// First back-off delay.
    pub base_delay: Duration,
    /// Ceiling for back-off delays.
    pub max_delay: Duration,
    /// Consecutive failed probes before the flask is declared lost.
    pub max_retries: u32,
    /// Bound on each probe request.
    pub probe_timeout: Duration,
}

impl Default for InvestigatorConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(120),
            max_retries: 11,
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// Confirms or clears suspicion about flasks.
pub struct Investigator {
    repo: Arc<Repository>,
    synthetic_tx: mpsc::Sender<LifecycleEvent>,
    metrics: Arc<ControlMetrics>,
    config: InvestigatorConfig,
    under_investigation: Mutex<HashSet<FlaskId>>,
}

impl Investigator {
    pub fn new(
        repo: Arc<Repository>,
        synthetic_tx: mpsc::Sender<LifecycleEvent>,
        metrics: Arc<ControlMetrics>,
        config: InvestigatorConfig,
    ) -> Self {
        Self {
            repo,
            synthetic_tx,
            metrics,
            config,
            under_investigation: Mutex::new(HashSet::new()),
        }
    }

    /// Consume the suspicion channel until shutdown, spawning one
    /// investigation task per implicated flask.
    pub async fn run(
        self: Arc<Self>,
        mut suspects_rx: mpsc::Receiver<Names>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("investigator started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                suspicion = suspects_rx.recv() => {
                    let Some(names) = suspicion else { break };
                    self.clone().open_investigation(names, shutdown.clone()).await;
                }
            }
        }
        info!("investigator stopped");
    }

    /// Start investigating a flask unless one is already running for it.
    pub async fn open_investigation(
        self: Arc<Self>,
        suspicion: Names,
        shutdown: watch::Receiver<bool>,
    ) {
        let flask_id = suspicion.mine.clone();
        let Some(flask) = self.repo.flask(&flask_id).await else {
            debug!(flask = %flask_id, "suspicion about unknown flask ignored");
            return;
        };
        if flask.state == FlaskState::Terminated {
            return;
        }

        {
            let mut active = self.under_investigation.lock().await;
            if !active.insert(flask_id.clone()) {
                debug!(flask = %flask_id, "already under investigation");
                return;
            }
        }

        warn!(
            flask = %flask_id,
            kind = %suspicion.kind,
            about = %suspicion.theirs,
            "opening investigation"
        );
        self.repo
            .set_flask_state(&flask_id, FlaskState::Investigating)
            .await;
        self.metrics.record_investigation();

        tokio::spawn(async move {
            self.investigate(flask, shutdown).await;
        });
    }

    async fn investigate(self: Arc<Self>, flask: Flask, mut shutdown: watch::Receiver<bool>) {
        let mut confirmed_lost = true;

        for attempt in 0..self.config.max_retries {
            let delay = backoff_delay(self.config.base_delay, self.config.max_delay, attempt);
            tokio::select! {
                _ = shutdown.changed() => {
                    confirmed_lost = false;
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if probe_flask(&flask.location, self.config.probe_timeout)
                .await
                .is_healthy()
            {
                info!(flask = %flask.id, attempt, "flask recovered, investigation closed");
                self.repo.set_flask_state(&flask.id, FlaskState::Active).await;
                confirmed_lost = false;
                break;
            }
            debug!(flask = %flask.id, attempt, "probe failed");
        }

        if confirmed_lost {
            warn!(
                flask = %flask.id,
                retries = self.config.max_retries,
                "investigation exhausted, declaring flask lost"
            );
            self.metrics.record_confirmed_loss();
            let event = LifecycleEvent {
                kind: EventKind::Terminate,
                asg: "investigation".to_string(),
                instance_id: flask.id.clone(),
                time: epoch_secs().to_string(),
            };
            if self.synthetic_tx.send(event).await.is_err() {
                warn!(flask = %flask.id, "lifecycle channel closed, loss not routed");
            }
        }

        let mut active = self.under_investigation.lock().await;
        active.remove(&flask.id);
    }
}

/// `min(cap, base · 2^i) · (1 + U(−0.25, 0.25))`.
fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = base
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(cap);
    let jitter: f64 = 1.0 + rand::thread_rng().gen_range(-0.25..=0.25);
    exp.mul_f64(jitter.max(0.0))
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

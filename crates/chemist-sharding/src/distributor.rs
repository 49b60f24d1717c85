//! Distributor — pushes assignments to flasks over HTTP.
//!
//! `POST {flask}/monitor` carries the full replacement set for that flask;
//! `POST {flask}/unmonitor` tells a flask to drop one target. Transient
//! failures (5xx, network) are retried with jittered back-off; a flask that
//! stays unreachable is handed to the investigator.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chemist_state::{Distribution, Flask, FlaskState, Names, Repository, Target};

use crate::error::{ShardingError, ShardingResult};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(1);

/// One entry in a monitor/unmonitor request body.
#[derive(Debug, Serialize)]
struct MonitorEntry<'a> {
    cluster: &'a str,
    uris: &'a BTreeSet<String>,
}

/// HTTP client for instructing flasks.
pub struct Distributor {
    repo: Arc<Repository>,
    client: reqwest::Client,
    timeout: Duration,
    suspects_tx: mpsc::Sender<Names>,
}

impl Distributor {
    pub fn new(
        repo: Arc<Repository>,
        timeout: Duration,
        suspects_tx: mpsc::Sender<Names>,
    ) -> ShardingResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            repo,
            client,
            timeout,
            suspects_tx,
        })
    }

    /// Push every entry of a delta to its flask.
    ///
    /// Entries are processed independently: one failing flask does not stop
    /// the rest. The first fatal error is returned; an unreachable flask is
    /// additionally marked Investigating and reported on the suspects
    /// channel.
    pub async fn distribute(&self, delta: &Distribution) -> ShardingResult<()> {
        let mut first_err = None;

        for (flask_id, targets) in delta {
            let Some(flask) = self.repo.flask(flask_id).await else {
                warn!(flask = %flask_id, "delta entry for unknown flask, skipping");
                continue;
            };
            let url = format!("{}/monitor", flask.location.base_url());
            let body: Vec<MonitorEntry> = targets
                .iter()
                .map(|t| MonitorEntry {
                    cluster: &t.cluster,
                    uris: &t.uris,
                })
                .collect();

            match self.post_with_retry(flask_id, &url, &body).await {
                Ok(()) => {
                    info!(flask = %flask_id, targets = targets.len(), "assignment pushed");
                }
                Err(err @ ShardingError::FlaskUnreachable(_)) => {
                    warn!(flask = %flask_id, error = %err, "flask unreachable, starting investigation");
                    self.repo
                        .set_flask_state(flask_id, FlaskState::Investigating)
                        .await;
                    let _ = self
                        .suspects_tx
                        .send(Names {
                            mine: flask_id.clone(),
                            kind: "distribute".to_string(),
                            theirs: String::new(),
                        })
                        .await;
                    first_err.get_or_insert(err);
                }
                Err(err) => {
                    warn!(flask = %flask_id, error = %err, "assignment push failed");
                    first_err.get_or_insert(err);
                }
            }
        }

        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Tell a flask to stop monitoring one target.
    ///
    /// The flask may already be gone; callers treat failures as advisory.
    pub async fn release(&self, flask: &Flask, target: &Target) -> ShardingResult<()> {
        let url = format!("{}/unmonitor", flask.location.base_url());
        let body = MonitorEntry {
            cluster: &target.cluster,
            uris: &target.uris,
        };
        self.post_with_retry(&flask.id, &url, &body).await
    }

    async fn post_with_retry<B: Serialize>(
        &self,
        flask_id: &str,
        url: &str,
        body: &B,
    ) -> ShardingResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let response = self
                .client
                .post(url)
                .json(body)
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if resp.status().is_client_error() => {
                    return Err(ShardingError::AssignmentRejected {
                        flask: flask_id.to_string(),
                        status: resp.status().as_u16(),
                    });
                }
                Ok(resp) => {
                    debug!(%url, status = %resp.status(), attempt, "retryable response");
                }
                Err(err) => {
                    debug!(%url, error = %err, attempt, "request error");
                }
            }

            if attempt >= MAX_ATTEMPTS {
                return Err(ShardingError::FlaskUnreachable(flask_id.to_string()));
            }
            tokio::time::sleep(retry_delay(attempt)).await;
        }
    }
}

/// Exponential back-off with ±25% jitter.
fn retry_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(RETRY_CAP);
    let jitter: f64 = 1.0 + rand::thread_rng().gen_range(-0.25..=0.25);
    exp.mul_f64(jitter.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use chemist_state::Location;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    type Received = Arc<Mutex<Vec<serde_json::Value>>>;

    async fn spawn_flask_endpoint(status: StatusCode) -> (std::net::SocketAddr, Received) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let state = received.clone();

        let app = Router::new()
            .route(
                "/monitor",
                post(
                    move |State(seen): State<Received>, Json(body): Json<serde_json::Value>| async move {
                        seen.lock().unwrap().push(body);
                        status
                    },
                ),
            )
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, received)
    }

    fn flask_at(id: &str, addr: std::net::SocketAddr) -> Flask {
        Flask {
            id: id.to_string(),
            location: Location {
                host: addr.ip().to_string(),
                port: addr.port(),
                protocol: "http".to_string(),
                datacenter: "dc".to_string(),
                intent: "mirroring".to_string(),
                templates: vec![],
            },
            state: FlaskState::Active,
        }
    }

    fn test_target(id: &str) -> Target {
        Target {
            id: id.to_string(),
            cluster: "web".to_string(),
            uris: BTreeSet::from([format!("http://10.0.0.2:1234/{id}")]),
        }
    }

    fn delta_for(flask_id: &str, targets: Vec<Target>) -> Distribution {
        BTreeMap::from([(flask_id.to_string(), targets)])
    }

    #[tokio::test]
    async fn distribute_posts_full_assignment() {
        let (addr, received) = spawn_flask_endpoint(StatusCode::OK).await;
        let repo = Arc::new(Repository::new());
        repo.increase_capacity(flask_at("f1", addr)).await.unwrap();

        let (suspects_tx, _suspects_rx) = mpsc::channel(8);
        let distributor =
            Distributor::new(repo, Duration::from_secs(1), suspects_tx).unwrap();

        distributor
            .distribute(&delta_for("f1", vec![test_target("t1"), test_target("t2")]))
            .await
            .unwrap();

        let bodies = received.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejection_is_fatal_and_not_retried() {
        let (addr, received) = spawn_flask_endpoint(StatusCode::BAD_REQUEST).await;
        let repo = Arc::new(Repository::new());
        repo.increase_capacity(flask_at("f1", addr)).await.unwrap();

        let (suspects_tx, _suspects_rx) = mpsc::channel(8);
        let distributor =
            Distributor::new(repo.clone(), Duration::from_secs(1), suspects_tx).unwrap();

        let result = distributor
            .distribute(&delta_for("f1", vec![test_target("t1")]))
            .await;

        assert!(matches!(
            result,
            Err(ShardingError::AssignmentRejected { status: 400, .. })
        ));
        assert_eq!(received.lock().unwrap().len(), 1);
        // Rejection is not an unreachability signal.
        assert_eq!(repo.flask("f1").await.unwrap().state, FlaskState::Active);
    }

    #[tokio::test]
    async fn unreachable_flask_goes_under_investigation() {
        let repo = Arc::new(Repository::new());
        // Port 1 is never listening.
        let addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        repo.increase_capacity(flask_at("f1", addr)).await.unwrap();

        let (suspects_tx, mut suspects_rx) = mpsc::channel(8);
        let distributor =
            Distributor::new(repo.clone(), Duration::from_millis(200), suspects_tx).unwrap();

        let result = distributor
            .distribute(&delta_for("f1", vec![test_target("t1")]))
            .await;

        assert!(matches!(result, Err(ShardingError::FlaskUnreachable(_))));
        assert_eq!(
            repo.flask("f1").await.unwrap().state,
            FlaskState::Investigating
        );
        let suspicion = suspects_rx.recv().await.unwrap();
        assert_eq!(suspicion.mine, "f1");
        assert_eq!(suspicion.kind, "distribute");
    }

    #[tokio::test]
    async fn unknown_flask_entry_is_skipped() {
        let repo = Arc::new(Repository::new());
        let (suspects_tx, _suspects_rx) = mpsc::channel(8);
        let distributor =
            Distributor::new(repo, Duration::from_millis(200), suspects_tx).unwrap();

        let result = distributor
            .distribute(&delta_for("ghost", vec![test_target("t1")]))
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn retry_delay_is_bounded_and_jittered() {
        for attempt in 1..=5 {
            let delay = retry_delay(attempt);
            // Cap plus maximum jitter.
            assert!(delay <= RETRY_CAP.mul_f64(1.25));
            assert!(delay >= RETRY_BASE.mul_f64(0.75) || attempt > 1);
        }
    }
}

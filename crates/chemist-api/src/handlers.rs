//! Admin HTTP handlers.
//!
//! Each handler reads/writes via the [`chemist_state::Repository`] and
//! returns a consistent `{success, data, error}` JSON envelope.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tracing::info;

use chemist_state::{Flask, FlaskId, LifecycleEvent, Target};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Shards ─────────────────────────────────────────────────────────

#[derive(serde::Serialize)]
pub struct ShardsView {
    pub shards: BTreeMap<FlaskId, Vec<Target>>,
    pub unassigned: Vec<Target>,
}

/// GET /shards
pub async fn list_shards(State(state): State<ApiState>) -> impl IntoResponse {
    let view = ShardsView {
        shards: state.repo.shard_view().await,
        unassigned: state.repo.unassigned_targets().await,
    };
    ApiResponse::ok(view)
}

#[derive(serde::Serialize)]
pub struct DistributeSummary {
    pub flasks: usize,
    pub targets: usize,
}

/// POST /distribute — force a rebalance of the unassigned pool.
pub async fn force_distribute(State(state): State<ApiState>) -> impl IntoResponse {
    let unassigned = state.repo.unassigned_targets().await;
    let snapshot = state.repo.shard_snapshot().await;
    let delta = state.strategy.locate_and_assign(&unassigned, &snapshot);
    state.repo.merge_distribution(&delta).await;

    let summary = DistributeSummary {
        flasks: delta.len(),
        targets: delta.values().map(Vec::len).sum(),
    };
    info!(
        flasks = summary.flasks,
        targets = summary.targets,
        "operator-forced distribution"
    );

    if state.distribute_tx.send(delta).await.is_err() {
        return error_response("distribute channel closed", StatusCode::SERVICE_UNAVAILABLE)
            .into_response();
    }
    ApiResponse::ok(summary).into_response()
}

// ── Events ─────────────────────────────────────────────────────────

/// GET /events
pub async fn list_events(State(state): State<ApiState>) -> Json<ApiResponse<Vec<LifecycleEvent>>> {
    ApiResponse::ok(state.repo.recent_events().await)
}

/// POST /events — inject a raw lifecycle message body.
///
/// Only available when chemist runs against the in-process queue; a cloud
/// deployment feeds events through its queue instead.
pub async fn inject_event(State(state): State<ApiState>, body: String) -> impl IntoResponse {
    let Some(queue) = &state.queue else {
        return error_response(
            "event injection disabled: no in-process queue",
            StatusCode::SERVICE_UNAVAILABLE,
        )
        .into_response();
    };
    match queue.push(body).await {
        Ok(receipt) => (StatusCode::ACCEPTED, ApiResponse::ok(receipt)).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Flasks ─────────────────────────────────────────────────────────

/// GET /flasks
pub async fn list_flasks(State(state): State<ApiState>) -> Json<ApiResponse<Vec<Flask>>> {
    ApiResponse::ok(state.repo.flasks().await)
}

// ── Prometheus ─────────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render_prometheus(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chemist_lifecycle::{EventQueue, InMemoryQueue};
    use chemist_metrics::ControlMetrics;
    use chemist_sharding::LeastLoadedSharder;
    use chemist_state::{EventKind, FlaskState, Location, Repository};
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn test_state() -> (ApiState, mpsc::Receiver<chemist_state::Distribution>) {
        let (distribute_tx, distribute_rx) = mpsc::channel(16);
        let state = ApiState {
            repo: Arc::new(Repository::new()),
            strategy: Arc::new(LeastLoadedSharder),
            distribute_tx,
            metrics: Arc::new(ControlMetrics::new()),
            queue: Some(InMemoryQueue::with_poll_timeout(Duration::from_millis(20))),
        };
        (state, distribute_rx)
    }

    fn test_flask(id: &str) -> Flask {
        Flask {
            id: id.to_string(),
            location: Location {
                host: "10.0.0.1".to_string(),
                port: 5775,
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

    async fn get_json(router: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn shards_view_includes_unassigned_pool() {
        let (state, _rx) = test_state();
        state.repo.increase_capacity(test_flask("f1")).await.unwrap();
        state.repo.add_instance(test_target("t1")).await;

        let router = crate::build_router(state);
        let (status, body) = get_json(router, "/shards").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["unassigned"][0]["id"], "t1");
        assert!(body["data"]["shards"]["f1"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn force_distribute_assigns_and_enqueues() {
        let (state, mut rx) = test_state();
        state.repo.increase_capacity(test_flask("f1")).await.unwrap();
        state.repo.add_instance(test_target("t1")).await;
        let repo = state.repo.clone();

        let router = crate::build_router(state);
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/distribute")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(repo.assigned_targets("f1").await.len(), 1);
        let delta = rx.recv().await.unwrap();
        assert!(delta.contains_key("f1"));
    }

    #[tokio::test]
    async fn events_listing_returns_the_ring() {
        let (state, _rx) = test_state();
        state
            .repo
            .add_event(LifecycleEvent {
                kind: EventKind::Launch,
                asg: "asg".to_string(),
                instance_id: "i-1".to_string(),
                time: "t".to_string(),
            })
            .await;

        let router = crate::build_router(state);
        let (status, body) = get_json(router, "/events").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["instance_id"], "i-1");
    }

    #[tokio::test]
    async fn event_injection_lands_on_the_queue() {
        let (state, _rx) = test_state();
        let queue = state.queue.clone().unwrap();

        let router = crate::build_router(state);
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/events")
                    .body(Body::from(
                        r#"{"kind":"Launch","asgName":"a","instanceId":"i-1","time":"t"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let batch = queue.receive().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].body.contains("i-1"));
    }

    #[tokio::test]
    async fn event_injection_without_queue_is_unavailable() {
        let (mut state, _rx) = test_state();
        state.queue = None;

        let router = crate::build_router(state);
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/events")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn flask_listing_carries_states() {
        let (state, _rx) = test_state();
        state.repo.increase_capacity(test_flask("f1")).await.unwrap();
        state
            .repo
            .set_flask_state("f1", FlaskState::Investigating)
            .await;

        let router = crate::build_router(state);
        let (status, body) = get_json(router, "/flasks").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["state"], "investigating");
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus_text() {
        let (state, _rx) = test_state();
        state.metrics.record_resharding();

        let router = crate::build_router(state);
        let response = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/plain"));
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("chemist_reshardings_total 1"));
    }
}

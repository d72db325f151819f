//! Health and metrics endpoint.
//!
//! Two JSON routes: `/healthz` (200 when every check passes, 503 when any
//! component reports an issue) and `/metrics` (lifetime supervisor counters
//! plus active-swarm and breaker stats).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use relay_core::breaker::{BreakerRegistry, BreakerStats};
use relay_core::dag::DagExecutor;
use relay_core::health::HealthRegistry;
use relay_core::supervisor::{SupervisorMetrics, TaskSupervisor};

#[derive(Clone)]
pub struct AppState {
    pub health: Arc<HealthRegistry>,
    pub supervisor: Arc<TaskSupervisor>,
    pub executor: Arc<DagExecutor>,
    pub breakers: Arc<BreakerRegistry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsResponse {
    tasks: SupervisorMetrics,
    active_swarms: usize,
    swarms: Vec<String>,
    breakers: Vec<BreakerStats>,
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.report().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let swarms = state.executor.list().await;
    let response = MetricsResponse {
        tasks: state.supervisor.metrics().await,
        active_swarms: swarms.len(),
        swarms: swarms.iter().map(DagExecutor::status_line).collect(),
        breakers: state.breakers.stats().await,
    };
    Json(response)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until cancelled.
pub async fn serve(addr: SocketAddr, state: AppState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "health endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::harness::ClaudeHarness;
    use relay_core::router::ModelRouter;
    use relay_core::supervisor::SupervisorConfig;
    use relay_test_utils::TempData;
    use tower::ServiceExt;

    async fn test_state() -> (TempData, AppState) {
        let data = TempData::new().await;
        let harness = Arc::new(ClaudeHarness::with_binary("/nonexistent"));
        let supervisor = TaskSupervisor::new(
            Arc::clone(&data.store),
            harness,
            SupervisorConfig::default(),
        );
        let executor = DagExecutor::new(
            Arc::clone(&data.store),
            Arc::clone(&supervisor),
            ModelRouter::default(),
        );
        let breakers = Arc::new(BreakerRegistry::default());
        let health = Arc::new(HealthRegistry::new());
        health.register(Arc::clone(&breakers) as _).await;
        let state = AppState {
            health,
            supervisor,
            executor,
            breakers,
        };
        (data, state)
    }

    #[tokio::test]
    async fn healthz_ok_when_no_issues() {
        let (_data, state) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn healthz_degraded_when_breaker_open() {
        let (_data, state) = test_state().await;
        let breaker = state
            .breakers
            .register(
                "crm",
                relay_core::breaker::BreakerConfig {
                    failure_threshold: 1,
                    ..Default::default()
                },
            )
            .await;
        let _ = breaker
            .exec::<(), _, _>(|| async { Err(anyhow::anyhow!("down")) })
            .await;

        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_serves_counters() {
        let (_data, state) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/metrics")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["activeSwarms"], 0);
        assert_eq!(json["tasks"]["totalCompleted"], 0);
    }
}

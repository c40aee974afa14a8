use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::rejection::WebSocketUpgradeRejection, ConnectInfo, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    config::ServerConfig,
    lifecycle::{self, LifecycleConfig},
    origin::{OriginError, OriginPolicy},
    registry::Registry,
};

pub struct AppState {
    pub registry: Registry,
    pub lifecycle: LifecycleConfig,
    pub origin_policy: OriginPolicy,
    pub shutdown: CancellationToken,
    tracker: TaskTracker,
    metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(config: &ServerConfig, metrics: PrometheusHandle) -> Self {
        Self {
            registry: Registry::new(config.registry.clone()),
            lifecycle: config.lifecycle.clone(),
            origin_policy: config.origin_policy.clone(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            metrics,
        }
    }

    /// Cancels every read loop and waits up to `grace` for them to finish.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.tracker.close();
        let drained = tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_ok();
        if drained {
            info!("all connections drained");
        } else {
            warn!(
                remaining = self.tracker.len(),
                grace_seconds = grace.as_secs(),
                "connections still open after shutdown grace period"
            );
        }
        drained
    }
}

#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("request is not a websocket upgrade: {0}")]
    NotUpgrade(#[from] WebSocketUpgradeRejection),
    #[error(transparent)]
    Origin(#[from] OriginError),
    #[error("server is shutting down")]
    ShuttingDown,
}

impl AcceptError {
    fn metric_label(&self) -> &'static str {
        match self {
            AcceptError::NotUpgrade(_) => "not_upgrade",
            AcceptError::Origin(_) => "origin",
            AcceptError::ShuttingDown => "shutting_down",
        }
    }
}

impl IntoResponse for AcceptError {
    fn into_response(self) -> Response {
        match self {
            AcceptError::NotUpgrade(rejection) => rejection.into_response(),
            AcceptError::Origin(err) => (StatusCode::FORBIDDEN, err.to_string()).into_response(),
            AcceptError::ShuttingDown => {
                (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response()
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_connections: usize,
    connection_ids: Vec<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until `shutdown` resolves, then drains open connections.
pub async fn serve<F>(
    listener: TcpListener,
    state: Arc<AppState>,
    grace: Duration,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let token = state.shutdown.clone();
    let app = router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown => {}
                _ = token.cancelled() => {}
            }
        })
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = grace.as_secs(),
        "shutdown signal received; draining connections"
    );
    state.drain(grace).await;
    Ok(())
}

async fn root_handler() -> &'static str {
    "WebSocket Server is Running"
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ids = state.registry.ids().await;
    Json(StatsResponse {
        active_connections: ids.len(),
        connection_ids: ids.iter().map(ToString::to_string).collect(),
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    info!(%remote_addr, "received websocket upgrade request");
    match accept(&state, &headers, ws) {
        Ok(ws) => ws
            .on_failed_upgrade(move |err| {
                counter!("beach_relay_accept_failures_total", 1, "reason" => "upgrade");
                error!(%remote_addr, error = %err, "websocket upgrade failed");
            })
            .on_upgrade(move |socket| async move {
                let task = lifecycle::serve_socket(
                    socket,
                    remote_addr,
                    state.registry.clone(),
                    state.lifecycle.clone(),
                    state.shutdown.clone(),
                );
                state.tracker.track_future(task).await;
            }),
        Err(err) => {
            counter!("beach_relay_accept_failures_total", 1, "reason" => err.metric_label());
            error!(%remote_addr, error = %err, "rejected websocket upgrade");
            err.into_response()
        }
    }
}

fn accept(
    state: &AppState,
    headers: &HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<WebSocketUpgrade, AcceptError> {
    if state.shutdown.is_cancelled() {
        return Err(AcceptError::ShuttingDown);
    }
    let ws = ws?;
    state.origin_policy.check(headers)?;
    Ok(ws)
}

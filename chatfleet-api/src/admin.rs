//! Admin HTTP endpoints: health checks, pre-stop hook and stats.

use std::future::Future;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chatfleet_cluster::{sync::ConnectionMetrics, sync::RouterStats};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::context::WorkerContext;
use crate::lifecycle::WorkerState;

#[derive(Debug, Serialize)]
struct StatsResponse {
    worker_id: String,
    state: WorkerState,
    connections: ConnectionMetrics,
    router: RouterStats,
}

#[derive(Debug, Serialize)]
struct OnlineResponse {
    count: usize,
    users: Vec<String>,
}

#[derive(Debug, Serialize)]
struct StateResponse {
    state: WorkerState,
}

pub fn create_admin_router(ctx: WorkerContext) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness_check))
        .route("/lifecycle/pre-stop", post(pre_stop))
        .route("/stats", get(stats))
        .route("/online", get(online))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Serve the admin router until `shutdown` resolves.
pub async fn serve_admin(
    listener: TcpListener,
    ctx: WorkerContext,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(address = %addr, "Admin HTTP listening");
    }
    axum::serve(listener, create_admin_router(ctx))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Liveness: the process is up.
async fn health_check() -> impl IntoResponse {
    "OK"
}

/// Readiness: only an active worker takes new clients.
async fn readiness_check(State(ctx): State<WorkerContext>) -> impl IntoResponse {
    let state = ctx.lifecycle.state();
    let status = if state == WorkerState::Active {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(StateResponse { state }))
}

/// Start draining and answer once the drain is over, so an orchestrator
/// pre-stop hook holds termination until clients have been moved off.
async fn pre_stop(State(ctx): State<WorkerContext>) -> impl IntoResponse {
    if ctx.lifecycle.request_drain() {
        info!("Drain requested through pre-stop hook");
    }

    // Bounded so a stuck drain cannot hang the hook forever
    if tokio::time::timeout(Duration::from_secs(120), ctx.lifecycle.closed())
        .await
        .is_err()
    {
        warn!("Pre-stop hook timed out waiting for drain");
    }

    Json(StateResponse {
        state: ctx.lifecycle.state(),
    })
}

async fn stats(State(ctx): State<WorkerContext>) -> impl IntoResponse {
    Json(StatsResponse {
        worker_id: ctx.worker_id.clone(),
        state: ctx.lifecycle.state(),
        connections: ctx.connections.metrics(),
        router: ctx.router.metrics().snapshot(),
    })
}

async fn online(State(ctx): State<WorkerContext>) -> impl IntoResponse {
    match ctx.presence.list_online().await {
        Ok(users) => Json(OnlineResponse {
            count: users.len(),
            users,
        })
        .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to list online users");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

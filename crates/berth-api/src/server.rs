//! HTTP server and routing

use crate::auth::{require_bearer, ApiKey};
use crate::{containers, schedulers};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use berth_controller::ReplicaSetController;
use berth_core::{Error, Result};
use berth_sched::{CpuScheduler, GpuScheduler, PortScheduler};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ReplicaSetController>,
    pub gpus: Arc<GpuScheduler>,
    pub cpus: Arc<CpuScheduler>,
    pub ports: Arc<PortScheduler>,
    pub api_key: ApiKey,
}

/// Build the full router: versioned API behind the bearer gate, plus an
/// ungated health probe
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/containers", post(containers::run))
        .route(
            "/containers/:name",
            get(containers::info)
                .delete(containers::delete)
                .patch(containers::patch),
        )
        .route("/containers/:name/history", get(containers::history))
        .route("/containers/:name/rollback", post(containers::rollback))
        .route("/containers/:name/restart", post(containers::restart))
        .route("/containers/:name/stop", post(containers::stop))
        .route("/containers/:name/pause", post(containers::pause))
        .route("/containers/:name/startup", post(containers::startup))
        .route("/containers/:name/execute", post(containers::execute))
        .route("/containers/:name/commit", post(containers::commit))
        .route("/schedulers/gpu/status", get(schedulers::gpu_status))
        .route("/schedulers/cpu/status", get(schedulers::cpu_status))
        .route("/schedulers/port/status", get(schedulers::port_status))
        .route("/schedulers/gpu/allocations", get(schedulers::gpu_allocations))
        .layer(middleware::from_fn_with_state(
            state.api_key.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process shuts down
pub async fn serve(bind_addr: SocketAddr, state: AppState) -> Result<()> {
    let app = build_router(state);
    info!(addr = %bind_addr, "http server listening");
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| Error::internal(format!("failed to bind {}: {}", bind_addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| Error::internal(format!("http server failed: {}", e)))?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

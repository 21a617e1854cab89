//! Scheduler observability endpoints

use crate::response::{ok, ApiResult};
use crate::server::AppState;
use axum::extract::State;
use serde_json::json;
use std::collections::BTreeMap;

fn status_payload(status: BTreeMap<String, bool>) -> serde_json::Value {
    let total = status.len();
    let in_use = status.values().filter(|used| **used).count();
    json!({ "status": status, "total": total, "inUse": in_use })
}

/// `GET /schedulers/gpu/status`
pub async fn gpu_status(State(state): State<AppState>) -> ApiResult {
    Ok(ok(status_payload(state.gpus.status())))
}

/// `GET /schedulers/cpu/status`
pub async fn cpu_status(State(state): State<AppState>) -> ApiResult {
    Ok(ok(status_payload(state.cpus.status())))
}

/// `GET /schedulers/port/status`
pub async fn port_status(State(state): State<AppState>) -> ApiResult {
    Ok(ok(status_payload(state.ports.status())))
}

/// `GET /schedulers/gpu/allocations` — which replica set holds which uuids
pub async fn gpu_allocations(State(state): State<AppState>) -> ApiResult {
    Ok(ok(state.gpus.alloc_map()))
}

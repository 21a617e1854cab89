//! Container lifecycle endpoints

use crate::response::{ok, ok_empty, ApiResult};
use crate::server::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use berth_controller::StopOptions;
use berth_core::{
    ContainerCommit, ContainerExecute, ContainerRun, PatchRequest, RollbackRequest,
};
use serde::Deserialize;
use serde_json::json;

/// Optional flags accepted by the stop endpoint
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StopRequest {
    pub restore_gpu: bool,
    pub restore_cpu: bool,
    pub restore_port: bool,
}

/// `POST /containers`
pub async fn run(State(state): State<AppState>, Json(spec): Json<ContainerRun>) -> ApiResult {
    let (id, container_name) = state.controller.run(&spec).await?;
    Ok(ok(json!({ "id": id, "containerName": container_name })))
}

/// `DELETE /containers/:name`
pub async fn delete(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    state.controller.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `PATCH /containers/:name`
pub async fn patch(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(spec): Json<PatchRequest>,
) -> ApiResult {
    let (id, new_container_name) = state.controller.patch(&name, &spec).await?;
    Ok(ok(json!({ "id": id, "newContainerName": new_container_name })))
}

/// `POST /containers/:name/rollback`
pub async fn rollback(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(spec): Json<RollbackRequest>,
) -> ApiResult {
    let new_container_name = state.controller.rollback(&name, &spec).await?;
    Ok(ok(json!({ "newContainerName": new_container_name })))
}

/// `POST /containers/:name/restart` — a fresh version with the same counts
pub async fn restart(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let (id, new_container_name) = state.controller.restart(&name).await?;
    Ok(ok(json!({ "id": id, "newContainerName": new_container_name })))
}

/// `POST /containers/:name/stop`
pub async fn stop(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<StopRequest>>,
) -> ApiResult {
    let flags = body.map(|Json(flags)| flags).unwrap_or_default();
    state
        .controller
        .stop(
            &name,
            StopOptions {
                restore_gpu: flags.restore_gpu,
                restore_cpu: flags.restore_cpu,
                restore_port: flags.restore_port,
                is_latest: true,
            },
        )
        .await?;
    Ok(ok_empty())
}

/// `POST /containers/:name/pause`
pub async fn pause(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    state.controller.pause(&name).await?;
    Ok(ok_empty())
}

/// `POST /containers/:name/startup` — in-place restart of the live version
pub async fn startup(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    state.controller.startup(&name).await?;
    Ok(ok_empty())
}

/// `POST /containers/:name/execute`
pub async fn execute(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(spec): Json<ContainerExecute>,
) -> ApiResult {
    let output = state.controller.execute(&name, &spec).await?;
    Ok(ok(output))
}

/// `POST /containers/:name/commit`
pub async fn commit(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(spec): Json<ContainerCommit>,
) -> ApiResult {
    let image_name = state.controller.commit(&name, &spec).await?;
    Ok(ok(json!({ "imageName": image_name })))
}

/// `GET /containers/:name`
pub async fn info(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let record = state.controller.info(&name).await?;
    Ok(ok(record))
}

/// `GET /containers/:name/history`
pub async fn history(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let items = state.controller.history(&name).await?;
    Ok(ok(items))
}

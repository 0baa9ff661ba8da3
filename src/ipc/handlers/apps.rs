use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use super::super::{IPCServer, InstallRequest, StartRequest};
use crate::error::OrchestratorError;
use crate::orchestrator::AppPatch;

type HandlerResult = Result<Json<serde_json::Value>, OrchestratorError>;

/// GET /api/apps - 설치된 앱 + 실행 여부
pub async fn list_apps(State(state): State<IPCServer>) -> HandlerResult {
    let apps = state.orchestrator.list_apps().await?;
    Ok(Json(json!({ "apps": apps })))
}

/// GET /api/installs - 진행 중인 설치
pub async fn list_installs(State(state): State<IPCServer>) -> impl IntoResponse {
    Json(json!({ "installs": state.orchestrator.active_installs() }))
}

/// POST /api/apps/:id/install - 완료(또는 취소/실패)까지 대기
pub async fn install_app(
    State(state): State<IPCServer>,
    Path(id): Path<String>,
    body: Option<Json<InstallRequest>>,
) -> HandlerResult {
    let version = body.and_then(|Json(b)| b.version);
    tracing::info!("IPC install request: {} {:?}", id, version);
    let app = state.orchestrator.install(&id, version.as_deref()).await?;
    Ok(Json(json!({ "success": true, "app": app })))
}

/// POST /api/apps/:id/cancel
pub async fn cancel_install(State(state): State<IPCServer>, Path(id): Path<String>) -> HandlerResult {
    state.orchestrator.cancel_install(&id)?;
    Ok(Json(json!({ "success": true, "app_id": id })))
}

/// DELETE /api/apps/:id
pub async fn uninstall_app(State(state): State<IPCServer>, Path(id): Path<String>) -> HandlerResult {
    let report = state.orchestrator.uninstall(&id).await?;
    Ok(Json(json!({ "success": true, "report": report })))
}

/// PATCH /api/apps/:id - auto_start / custom_args / show_on_dashboard
pub async fn update_app(
    State(state): State<IPCServer>,
    Path(id): Path<String>,
    Json(patch): Json<AppPatch>,
) -> HandlerResult {
    let app = state.orchestrator.update_app(&id, &patch)?;
    Ok(Json(json!({ "success": true, "app": app })))
}

// ── Service control ──────────────────────────────────────

/// POST /api/apps/:id/start
pub async fn start_app(
    State(state): State<IPCServer>,
    Path(id): Path<String>,
    body: Option<Json<StartRequest>>,
) -> HandlerResult {
    let args = body.and_then(|Json(b)| b.args);
    let pid = state.orchestrator.start_app(&id, args.as_deref()).await?;
    Ok(Json(json!({ "success": true, "app_id": id, "pid": pid })))
}

/// POST /api/apps/:id/stop
pub async fn stop_app(State(state): State<IPCServer>, Path(id): Path<String>) -> HandlerResult {
    state.orchestrator.stop_app(&id).await?;
    Ok(Json(json!({ "success": true, "app_id": id })))
}

/// POST /api/apps/:id/restart
pub async fn restart_app(
    State(state): State<IPCServer>,
    Path(id): Path<String>,
    body: Option<Json<StartRequest>>,
) -> HandlerResult {
    let args = body.and_then(|Json(b)| b.args);
    let pid = state.orchestrator.restart_app(&id, args.as_deref()).await?;
    Ok(Json(json!({ "success": true, "app_id": id, "pid": pid })))
}

/// GET /api/apps/:id/status - 실행 파일 이름 기반
pub async fn app_status(State(state): State<IPCServer>, Path(id): Path<String>) -> HandlerResult {
    let status = state.orchestrator.status(&id).await?;
    Ok(Json(json!(status)))
}

/// GET /api/apps/:id/logs
pub async fn get_logs(State(state): State<IPCServer>, Path(id): Path<String>) -> impl IntoResponse {
    let logs = state.orchestrator.logs(&id).await;
    Json(json!({ "app_id": id, "logs": logs }))
}

/// DELETE /api/apps/:id/logs
pub async fn clear_logs(State(state): State<IPCServer>, Path(id): Path<String>) -> impl IntoResponse {
    state.orchestrator.clear_logs(&id).await;
    Json(json!({ "success": true, "app_id": id }))
}

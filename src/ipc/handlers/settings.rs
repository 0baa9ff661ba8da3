use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use super::super::{IPCServer, SettingRequest};
use crate::error::OrchestratorError;

/// GET /api/settings/:key
pub async fn get_setting(
    State(state): State<IPCServer>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let value = state.orchestrator.get_setting(&key)?;
    Ok(Json(json!({ "key": key, "value": value })))
}

/// PUT /api/settings/:key - 저장 후 의존 앱 재설정 훅 실행
pub async fn put_setting(
    State(state): State<IPCServer>,
    Path(key): Path<String>,
    Json(body): Json<SettingRequest>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let reconfigured = state.orchestrator.set_setting(&key, &body.value).await?;
    Ok(Json(json!({
        "success": true,
        "key": key,
        "reconfigured": reconfigured,
    })))
}

use axum::{extract::State, response::IntoResponse, Json};

use super::super::IPCServer;
use crate::error::OrchestratorError;

/// GET /api/catalog - 로컬 카탈로그 문서
pub async fn get_catalog(State(state): State<IPCServer>) -> impl IntoResponse {
    Json(state.orchestrator.catalog().await)
}

/// POST /api/catalog/refresh - 원격 manifest에서 버전 목록 갱신
pub async fn refresh_catalog(State(state): State<IPCServer>) -> Result<impl IntoResponse, OrchestratorError> {
    let summary = state.orchestrator.refresh_catalog().await?;
    Ok(Json(summary))
}

//! 로컬 HTTP 제어 API (axum)
//!
//! 모든 핸들러는 `Orchestrator` 메서드 하나로 위임하고, 실패는
//! `OrchestratorError`의 JSON 형식과 상태 코드로 그대로 돌려줍니다.

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::orchestrator::Orchestrator;

// ─── Request bodies ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstallRequest {
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
    pub args: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettingRequest {
    pub value: String,
}

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub orchestrator: Arc<Orchestrator>,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(orchestrator: Arc<Orchestrator>, listen_addr: &str) -> Self {
        Self {
            orchestrator,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        use handlers::{apps, catalog, settings};

        Router::new()
            .route("/api/catalog", get(catalog::get_catalog))
            .route("/api/catalog/refresh", post(catalog::refresh_catalog))
            .route("/api/installs", get(apps::list_installs))
            .route("/api/apps", get(apps::list_apps))
            .route("/api/apps/:id", axum::routing::patch(apps::update_app).delete(apps::uninstall_app))
            .route("/api/apps/:id/install", post(apps::install_app))
            .route("/api/apps/:id/cancel", post(apps::cancel_install))
            .route("/api/apps/:id/start", post(apps::start_app))
            .route("/api/apps/:id/stop", post(apps::stop_app))
            .route("/api/apps/:id/restart", post(apps::restart_app))
            .route("/api/apps/:id/status", get(apps::app_status))
            .route("/api/apps/:id/logs", get(apps::get_logs).delete(apps::clear_logs))
            .route("/api/settings/:key", get(settings::get_setting).put(settings::put_setting))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        tracing::info!("IPC HTTP server starting on {}", self.listen_addr);
        let router = self.router();

        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

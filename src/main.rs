use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use devstack_core::config::GlobalConfig;
use devstack_core::ipc::IPCServer;
use devstack_core::Orchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("devstack daemon starting");

    let cfg = GlobalConfig::load()?;
    tracing::info!("Data root: {}", cfg.data_root.display());
    let orchestrator = Arc::new(Orchestrator::open(&cfg)?);

    // 자동 시작 복구는 IPC 서버를 막지 않도록 백그라운드에서
    let recovery = orchestrator.clone();
    tokio::spawn(async move {
        match recovery.recover_auto_start().await {
            Ok(report) => tracing::info!(
                "Auto-start recovery: {} started, {} failed",
                report.started.len(),
                report.failed.len()
            ),
            Err(e) => tracing::error!("Auto-start recovery failed: {}", e),
        }
    });

    let ipc_server = IPCServer::new(orchestrator.clone(), &cfg.ipc_listen);
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, cleaning up...");
    };
    if let Err(e) = ipc_server.start(shutdown).await {
        tracing::error!("IPC server error: {}", e);
    }

    // Ctrl+C 이후 또는 서버 오류 시: 설치 취소, 서비스 정지 (auto_start 플래그는 유지)
    orchestrator.shutdown().await;
    tracing::info!("devstack daemon shut down");
    Ok(())
}

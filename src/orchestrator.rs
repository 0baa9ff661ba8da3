//! Orchestrator: 카탈로그, 설치 파이프라인, 슈퍼바이저를 소유하는 단일 값
//!
//! 데몬 시작 시 한 번 만들어지고 `shutdown()`으로 명시적으로 정리됩니다.
//! IPC 핸들러는 이 타입의 메서드만 호출합니다.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::catalog::resolver::RefreshSummary;
use crate::catalog::{Catalog, CatalogDocument, CatalogResolver};
use crate::config::GlobalConfig;
use crate::error::{Result, ValidationError};
use crate::family::{AppFamily, FamilyContext, FamilyTable};
use crate::hosts::{FileHostsEditor, HostsEditor, NoopHosts};
use crate::install::{
    ActiveInstall, ArchiveExtractor, ArchiveSource, Extractor, HttpDownloader, InstallPipeline, ProgressEvent,
};
use crate::registry::{InstallRegistry, InstalledApp};
use crate::supervisor::managed_process::LogEvent;
use crate::supervisor::{AutoStartReport, Supervisor, SupervisorConfig};

/// Installed row plus a live running flag.
#[derive(Debug, Clone, Serialize)]
pub struct AppSummary {
    #[serde(flatten)]
    pub app: InstalledApp,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub app_id: String,
    pub running: bool,
    /// Pid of the process this daemon started, if it is tracking one.
    pub pid: Option<u32>,
}

/// Partial update of a registry row. An empty `custom_args` clears it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppPatch {
    pub auto_start: Option<bool>,
    pub custom_args: Option<String>,
    pub show_on_dashboard: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UninstallReport {
    pub app_id: String,
    pub was_running: bool,
    /// Virtual-host domains purged along with a reverse proxy.
    pub removed_domains: Vec<String>,
}

pub struct Orchestrator {
    catalog: Arc<RwLock<Catalog>>,
    resolver: CatalogResolver,
    registry: Arc<InstallRegistry>,
    families: Arc<FamilyTable>,
    pipeline: Arc<InstallPipeline>,
    supervisor: Arc<Supervisor>,
    hosts: Arc<dyn HostsEditor>,
}

impl Orchestrator {
    /// Open the on-disk catalog and registry under `config.data_root`.
    pub fn open(config: &GlobalConfig) -> Result<Self> {
        let catalog = Catalog::load(config.catalog_path())?;
        let registry = Arc::new(InstallRegistry::open(&config.registry_path())?);
        let source: Arc<dyn ArchiveSource> = Arc::new(HttpDownloader::new(config.timeouts.download())?);
        let extractor: Arc<dyn Extractor> = Arc::new(ArchiveExtractor::new(config.archiver()));
        let hosts: Arc<dyn HostsEditor> = match &config.hosts_file {
            Some(path) => Arc::new(FileHostsEditor::new(path)),
            None => Arc::new(NoopHosts),
        };
        Self::with_components(config, catalog, registry, source, extractor, hosts)
    }

    /// Wire explicit components; used by `open` and by tests with mock sources.
    pub fn with_components(
        config: &GlobalConfig,
        catalog: Catalog,
        registry: Arc<InstallRegistry>,
        source: Arc<dyn ArchiveSource>,
        extractor: Arc<dyn Extractor>,
        hosts: Arc<dyn HostsEditor>,
    ) -> Result<Self> {
        Self::with_families(config, catalog, registry, FamilyTable::builtin(), source, extractor, hosts)
    }

    pub fn with_families(
        config: &GlobalConfig,
        catalog: Catalog,
        registry: Arc<InstallRegistry>,
        families: FamilyTable,
        source: Arc<dyn ArchiveSource>,
        extractor: Arc<dyn Extractor>,
        hosts: Arc<dyn HostsEditor>,
    ) -> Result<Self> {
        let catalog = Arc::new(RwLock::new(catalog));
        let families = Arc::new(families);
        let resolver = CatalogResolver::new(
            &config.manifest_url,
            &config.download_base_url,
            config.timeouts.manifest(),
        )?;
        let pipeline = Arc::new(InstallPipeline::new(
            config.apps_dir(),
            Arc::clone(&catalog),
            Arc::clone(&registry),
            Arc::clone(&families),
            source,
            extractor,
        ));
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&registry),
            Arc::clone(&families),
            SupervisorConfig::from(config),
        ));
        Ok(Self {
            catalog,
            resolver,
            registry,
            families,
            pipeline,
            supervisor,
            hosts,
        })
    }

    pub fn registry(&self) -> &Arc<InstallRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn pipeline(&self) -> &Arc<InstallPipeline> {
        &self.pipeline
    }

    fn installed(&self, app_id: &str) -> Result<InstalledApp> {
        self.registry
            .get(app_id)?
            .ok_or_else(|| ValidationError::NotInstalled(app_id.to_string()).into())
    }

    fn family(&self, app_id: &str) -> Arc<dyn AppFamily> {
        self.families.lookup(app_id)
    }

    // ── Catalog ──────────────────────────────────────────────

    pub async fn catalog(&self) -> CatalogDocument {
        self.catalog.read().await.document().clone()
    }

    async fn catalog_default_args(&self, app_id: &str) -> String {
        self.catalog
            .read()
            .await
            .entry(app_id)
            .map(|e| e.default_args.clone())
            .unwrap_or_default()
    }

    pub async fn refresh_catalog(&self) -> Result<RefreshSummary> {
        let mut catalog = self.catalog.write().await;
        self.resolver.refresh(&mut catalog).await
    }

    // ── Install ──────────────────────────────────────────────

    /// Install or reinstall. A running app keeps its files locked, so reinstalling
    /// one is refused until it is stopped.
    pub async fn install(&self, app_id: &str, version: Option<&str>) -> Result<InstalledApp> {
        if let Some(row) = self.registry.get(app_id)? {
            if self.supervisor.tracked_pid(app_id).is_some()
                || self.supervisor.status(app_id, Path::new(&row.exec_path)).await
            {
                return Err(ValidationError::AppRunning(app_id.to_string()).into());
            }
        }
        self.pipeline.install(app_id, version).await
    }

    pub fn cancel_install(&self, app_id: &str) -> Result<()> {
        self.pipeline.cancel(app_id)
    }

    pub fn active_installs(&self) -> Vec<ActiveInstall> {
        self.pipeline.active_installs()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.pipeline.subscribe()
    }

    /// Stop, delete files, delete the row, and purge dependent state.
    pub async fn uninstall(&self, app_id: &str) -> Result<UninstallReport> {
        if self.pipeline.is_installing(app_id) {
            return Err(ValidationError::AlreadyInstalling(app_id.to_string()).into());
        }
        let row = self.installed(app_id)?;
        let family = self.family(app_id);
        let exec_path = PathBuf::from(&row.exec_path);
        let mut report = UninstallReport {
            app_id: app_id.to_string(),
            ..Default::default()
        };

        if self.supervisor.tracked_pid(app_id).is_some() || self.supervisor.status(app_id, &exec_path).await {
            report.was_running = true;
            if let Err(e) = self.supervisor.stop(app_id, &exec_path, family.stop_args()).await {
                tracing::warn!("Stopping '{}' before uninstall failed: {}", app_id, e);
            }
        }

        crate::install::remove_dir_best_effort(Path::new(&row.install_path));
        self.registry.delete(app_id)?;

        if let Some(key) = family.default_version_key() {
            if self.registry.get_setting(key)?.as_deref() == Some(row.installed_version.as_str()) {
                self.registry.delete_setting(key)?;
                tracing::info!("Cleared {} (pointed at uninstalled {})", key, app_id);
            }
        }

        if family.is_reverse_proxy() {
            report.removed_domains = self.registry.remove_vhosts_for(app_id)?;
            if !report.removed_domains.is_empty() {
                if let Err(e) = self.hosts.remove_domains(&report.removed_domains).await {
                    tracing::warn!("Hosts cleanup for '{}' failed: {}", app_id, e);
                }
            }
        }

        self.supervisor.clear_logs(app_id).await;
        tracing::info!("Uninstalled '{}' {}", app_id, row.installed_version);
        Ok(report)
    }

    // ── Services ─────────────────────────────────────────────

    /// Start with `args`, else stored custom args, else the family default,
    /// else the catalog's `default_args`. Success marks the row for auto-start.
    /// Only explicit `args` are remembered as custom args.
    pub async fn start_app(&self, app_id: &str, args: Option<&str>) -> Result<u32> {
        let row = self.installed(app_id)?;
        let exec_path = PathBuf::from(&row.exec_path);
        let resolved = match args {
            Some(a) => a.to_string(),
            None => {
                let resolved = self.supervisor.resolve_start_args(app_id, &exec_path);
                if resolved.trim().is_empty() {
                    self.catalog_default_args(app_id).await
                } else {
                    resolved
                }
            }
        };

        let pid = self.supervisor.start(app_id, &exec_path, &resolved).await?;
        self.registry.set_auto_start(app_id, true)?;
        // 패밀리 기본값은 설정에서 매번 다시 계산되므로 저장하지 않는다
        if let Some(a) = args {
            let stored = (!a.trim().is_empty()).then_some(a);
            self.registry.set_custom_args(app_id, stored)?;
        }
        Ok(pid)
    }

    pub async fn stop_app(&self, app_id: &str) -> Result<()> {
        let row = self.installed(app_id)?;
        let stop_args = self.family(app_id).stop_args();
        self.supervisor
            .stop(app_id, Path::new(&row.exec_path), stop_args)
            .await
    }

    pub async fn restart_app(&self, app_id: &str, args: Option<&str>) -> Result<u32> {
        let row = self.installed(app_id)?;
        let stop_args = self.family(app_id).stop_args();
        let pid = self
            .supervisor
            .restart(app_id, Path::new(&row.exec_path), args, stop_args)
            .await?;
        if let Some(a) = args {
            let stored = (!a.trim().is_empty()).then_some(a);
            self.registry.set_custom_args(app_id, stored)?;
        }
        Ok(pid)
    }

    pub async fn status(&self, app_id: &str) -> Result<AppStatus> {
        let row = self.installed(app_id)?;
        Ok(AppStatus {
            app_id: app_id.to_string(),
            running: self.supervisor.status(app_id, Path::new(&row.exec_path)).await,
            pid: self.supervisor.tracked_pid(app_id),
        })
    }

    pub async fn list_apps(&self) -> Result<Vec<AppSummary>> {
        let mut out = Vec::new();
        for app in self.registry.list()? {
            let running = self.supervisor.tracked_pid(&app.app_id).is_some()
                || self.supervisor.status(&app.app_id, Path::new(&app.exec_path)).await;
            out.push(AppSummary { app, running });
        }
        Ok(out)
    }

    pub fn update_app(&self, app_id: &str, patch: &AppPatch) -> Result<InstalledApp> {
        self.installed(app_id)?;
        if let Some(v) = patch.auto_start {
            self.registry.set_auto_start(app_id, v)?;
        }
        if let Some(args) = &patch.custom_args {
            let stored = (!args.trim().is_empty()).then_some(args.as_str());
            self.registry.set_custom_args(app_id, stored)?;
        }
        if let Some(v) = patch.show_on_dashboard {
            self.registry.set_show_on_dashboard(app_id, v)?;
        }
        self.installed(app_id)
    }

    pub async fn recover_auto_start(&self) -> Result<AutoStartReport> {
        self.supervisor.recover_auto_start().await
    }

    pub async fn logs(&self, app_id: &str) -> Vec<LogEvent> {
        self.supervisor.logs(app_id).await
    }

    pub async fn clear_logs(&self, app_id: &str) {
        self.supervisor.clear_logs(app_id).await
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEvent> {
        self.supervisor.subscribe_logs()
    }

    // ── Settings ─────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.registry.get_setting(key)
    }

    /// Persist a setting and let dependent apps reconfigure themselves.
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<Vec<String>> {
        self.registry.set_setting(key, value)?;
        self.dependency_changed(key).await
    }

    /// Ask every installed app's family to react to `key`. Rewritten apps that
    /// are running get restarted. Returns the ids that changed.
    pub async fn dependency_changed(&self, key: &str) -> Result<Vec<String>> {
        let mut changed = Vec::new();
        for row in self.registry.list()? {
            let family = self.family(&row.app_id);
            let exec_path = PathBuf::from(&row.exec_path);
            let install_dir = PathBuf::from(&row.install_path);
            let ctx = FamilyContext {
                app_id: &row.app_id,
                install_dir: &install_dir,
                exec_path: &exec_path,
                registry: &self.registry,
            };
            match family.reconfigure(&ctx, key) {
                Ok(true) => changed.push(row.app_id.clone()),
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!("Reconfiguring '{}' for {} failed: {:#}", row.app_id, key, e);
                    continue;
                }
            }

            if self.supervisor.tracked_pid(&row.app_id).is_some() {
                tracing::info!("Restarting '{}' after {} changed", row.app_id, key);
                if let Err(e) = self
                    .supervisor
                    .restart(&row.app_id, &exec_path, None, family.stop_args())
                    .await
                {
                    tracing::warn!("Restart of '{}' failed: {}", row.app_id, e);
                }
            }
        }
        Ok(changed)
    }

    // ── Lifecycle ────────────────────────────────────────────

    /// Cancel in-flight installs and stop tracked services.
    pub async fn shutdown(&self) {
        for active in self.pipeline.active_installs() {
            if let Err(e) = self.pipeline.cancel(&active.app_id) {
                tracing::debug!("{}", e);
            }
        }
        self.supervisor.shutdown().await;
        tracing::info!("Orchestrator shut down");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::hosts::test_support::RecordingHosts;
    use crate::install::download::test_support::MemorySource;

    pub fn nginx_zip() -> Vec<u8> {
        crate::install::test_support::zip_bytes(&[
            ("nginx-1.28.1/nginx.exe", b"MZ"),
            ("nginx-1.28.1/conf/mime.types", b"types {}"),
        ])
    }

    pub fn php_zip() -> Vec<u8> {
        crate::install::test_support::zip_bytes(&[
            ("php-cgi.exe", b"MZ"),
            ("php.ini-development", b"[PHP]\n;extension_dir = \"ext\"\n"),
        ])
    }

    pub struct Fixture {
        pub dir: tempfile::TempDir,
        pub hosts: Arc<RecordingHosts>,
        pub orchestrator: Arc<Orchestrator>,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = GlobalConfig::with_data_root(dir.path());
            let source = MemorySource::with("mem://nginx-1.28.1.zip", nginx_zip());
            source.insert("mem://php-8.3.10.zip", php_zip());
            let hosts = Arc::new(RecordingHosts::default());
            let orchestrator = Orchestrator::with_components(
                &config,
                Catalog::new(config.catalog_path(), crate::install::test_support::catalog_document()),
                Arc::new(InstallRegistry::open_in_memory().unwrap()),
                Arc::new(source),
                Arc::new(ArchiveExtractor::builtin()),
                hosts.clone(),
            )
            .unwrap();
            Self {
                dir,
                hosts,
                orchestrator: Arc::new(orchestrator),
            }
        }
    }
}

//! Install Pipeline
//!
//! `GroupCheck → Downloading → Extracting → Locating → Configuring → Persisting`
//! with `Done`, `Cancelled` and `Failed` as terminals. One [`InstallContext`]
//! exists per in-flight app id; its cancellation token is checked between
//! every stage and inside the download/extraction loops.

pub mod download;
pub mod extract;
pub mod locate;
pub mod progress;

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::catalog::{AppVersion, Catalog, CatalogEntry};
use crate::error::{OrchestratorError, Result, ValidationError};
use crate::family::{FamilyContext, FamilyTable};
use crate::registry::{InstallRegistry, InstalledApp};
use crate::utils::now_rfc3339;

pub use download::{ArchiveSource, DownloadOutcome, HttpDownloader};
pub use extract::{ArchiveExtractor, ExtractEvent, Extractor};
pub use progress::{InstallPhase, ProgressEvent, ProgressReporter};

use progress::{download_progress, extract_progress};

/// Subdirectory of the install root holding the archive while it downloads.
pub const DOWNLOAD_DIR: &str = ".download";
/// Extraction target; swapped into the install root only once the executable is found.
pub const STAGING_DIR: &str = ".staging";
/// The replaced tree during a swap, restored if configuring or persisting fails.
pub const PREVIOUS_DIR: &str = ".previous";

const WORK_DIRS: [&str; 3] = [DOWNLOAD_DIR, STAGING_DIR, PREVIOUS_DIR];

struct InstallContext {
    generation: u64,
    cancel: CancellationToken,
    /// What cancellation may delete: the whole root for a fresh install,
    /// only the work directories when an installed version is being replaced.
    partial_dirs: Vec<PathBuf>,
    reporter: Arc<ProgressReporter>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveInstall {
    pub app_id: String,
    pub phase: InstallPhase,
    pub cancelled: bool,
}

pub struct InstallPipeline {
    apps_dir: PathBuf,
    catalog: Arc<RwLock<Catalog>>,
    registry: Arc<InstallRegistry>,
    families: Arc<FamilyTable>,
    source: Arc<dyn ArchiveSource>,
    extractor: Arc<dyn Extractor>,
    active: Mutex<HashMap<String, InstallContext>>,
    next_generation: AtomicU64,
    events: broadcast::Sender<ProgressEvent>,
}

impl InstallPipeline {
    pub fn new(
        apps_dir: impl Into<PathBuf>,
        catalog: Arc<RwLock<Catalog>>,
        registry: Arc<InstallRegistry>,
        families: Arc<FamilyTable>,
        source: Arc<dyn ArchiveSource>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            apps_dir: apps_dir.into(),
            catalog,
            registry,
            families,
            source,
            extractor,
            active: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    pub fn install_dir(&self, app_id: &str) -> PathBuf {
        self.apps_dir.join(app_id)
    }

    fn lock_active(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, InstallContext>>> {
        self.active
            .lock()
            .map_err(|_| OrchestratorError::State("active install map poisoned".into()))
    }

    pub fn active_installs(&self) -> Vec<ActiveInstall> {
        let Ok(map) = self.active.lock() else {
            return Vec::new();
        };
        let mut out: Vec<ActiveInstall> = map
            .iter()
            .map(|(id, ctx)| ActiveInstall {
                app_id: id.clone(),
                phase: ctx.reporter.phase(),
                cancelled: ctx.cancel.is_cancelled(),
            })
            .collect();
        out.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        out
    }

    pub fn is_installing(&self, app_id: &str) -> bool {
        self.active
            .lock()
            .map(|m| m.get(app_id).map(|c| !c.cancel.is_cancelled()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Single-flight guard. A context whose token is already cancelled is stale
    /// and gets replaced.
    fn begin(&self, app_id: &str) -> Result<(u64, CancellationToken, Arc<ProgressReporter>)> {
        let mut map = self.lock_active()?;
        if let Some(existing) = map.get(app_id) {
            if !existing.cancel.is_cancelled() {
                return Err(ValidationError::AlreadyInstalling(app_id.to_string()).into());
            }
            tracing::warn!("Clearing stale cancelled install context for '{}'", app_id);
            map.remove(app_id);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let reporter = Arc::new(ProgressReporter::new(app_id, self.events.clone()));
        let partial_dirs = self.partial_dirs(app_id)?;
        map.insert(
            app_id.to_string(),
            InstallContext {
                generation,
                cancel: cancel.clone(),
                partial_dirs,
                reporter: reporter.clone(),
            },
        );
        Ok((generation, cancel, reporter))
    }

    fn partial_dirs(&self, app_id: &str) -> Result<Vec<PathBuf>> {
        let install_dir = self.install_dir(app_id);
        if self.registry.get(app_id)?.is_some() {
            Ok(WORK_DIRS[..2].iter().map(|d| install_dir.join(d)).collect())
        } else {
            Ok(vec![install_dir])
        }
    }

    /// Cancel an in-flight install and eagerly remove its partial directories.
    /// A version that was already installed stays in place.
    pub fn cancel(&self, app_id: &str) -> Result<()> {
        let partial_dirs = {
            let map = self.lock_active()?;
            let ctx = map
                .get(app_id)
                .ok_or_else(|| ValidationError::NotInstalling(app_id.to_string()))?;
            ctx.cancel.cancel();
            ctx.partial_dirs.clone()
        };
        tracing::info!("Install of '{}' cancelled", app_id);
        for dir in &partial_dirs {
            remove_dir_best_effort(dir);
        }
        Ok(())
    }

    /// Install `version` (or the catalog's latest) of `app_id`.
    pub async fn install(&self, app_id: &str, version: Option<&str>) -> Result<InstalledApp> {
        let (entry, app_version) = {
            let catalog = self.catalog.read().await;
            let entry = catalog.entry(app_id)?.clone();
            let app_version = match version {
                Some(v) => catalog.version(app_id, v)?.clone(),
                None => catalog.latest(app_id)?.clone(),
            };
            (entry, app_version)
        };

        let (generation, cancel, reporter) = self.begin(app_id)?;
        tracing::info!("Installing {} {}", app_id, app_version.version);

        let result = self.run(&entry, &app_version, &cancel, &reporter).await;
        let result = match result {
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                if !e.is_cancelled() {
                    tracing::debug!("Error after cancellation of '{}' treated as cancel: {}", app_id, e);
                }
                Err(OrchestratorError::Cancelled(app_id.to_string()))
            }
            other => other,
        };

        self.finish(app_id, generation, &result, &reporter);
        result
    }

    async fn run(
        &self,
        entry: &CatalogEntry,
        version: &AppVersion,
        cancel: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<InstalledApp> {
        let app_id = entry.id.as_str();

        // ── group check (before any filesystem write) ──
        reporter.report(InstallPhase::GroupCheck, 0, "Checking conflicts");
        self.check_group(entry).await?;
        checkpoint(app_id, cancel)?;

        // ── download ──
        let install_dir = self.install_dir(app_id);
        let download_dir = install_dir.join(DOWNLOAD_DIR);
        let staging_dir = install_dir.join(STAGING_DIR);
        // 중단된 이전 실행이 남긴 작업 디렉터리
        for dir in WORK_DIRS {
            remove_dir_if_exists(&install_dir.join(dir)).await?;
        }
        tokio::fs::create_dir_all(&download_dir)
            .await
            .map_err(|e| OrchestratorError::fs("create", &download_dir, e))?;
        let archive = download_dir.join(&version.filename);

        reporter.report(InstallPhase::Downloading, 0, "Downloading");
        let on_progress = |downloaded: u64, total: Option<u64>| {
            reporter.report(InstallPhase::Downloading, download_progress(downloaded, total), "Downloading");
        };
        let outcome = self
            .source
            .fetch(&version.download_url, &archive, &on_progress, cancel)
            .await?;
        checkpoint(app_id, cancel)?;

        if let Some(expected) = version.sha1.as_deref().filter(|s| !s.is_empty()) {
            if !download::digest_matches(expected, &outcome.sha1) {
                return Err(OrchestratorError::Archive(format!(
                    "SHA-1 mismatch for {}: expected {}, got {}",
                    version.filename, expected, outcome.sha1
                )));
            }
        }
        reporter.report(InstallPhase::Downloading, 50, "Downloaded");

        // ── extract (into staging) ──
        reporter.report(InstallPhase::Extracting, 50, "Extracting");
        self.extract(&archive, &staging_dir, cancel, reporter).await?;
        checkpoint(app_id, cancel)?;
        if let Err(e) = remove_dir_if_exists(&download_dir).await {
            tracing::warn!("{}", e);
        }

        // ── locate ──
        reporter.report(InstallPhase::Locating, 90, "Locating executable");
        let (exec_rel, cli_rel) = {
            let root = staging_dir.clone();
            let exec_target = entry.exec_file.clone();
            let cli_target = entry.cli_file.clone();
            tokio::task::spawn_blocking(move || {
                let exec = locate::find_executable(&root, &exec_target);
                let cli = cli_target.map(|t| {
                    let found = locate::find_executable(&root, &t);
                    (t, found)
                });
                let relative = |p: PathBuf| p.strip_prefix(&root).map(Path::to_path_buf).unwrap_or(p);
                (
                    exec.map(relative),
                    cli.map(|(t, found)| (t, found.map(relative))),
                )
            })
            .await
            .map_err(|e| OrchestratorError::Filesystem(e.to_string()))?
        };
        let exec_rel = exec_rel.ok_or_else(|| {
            OrchestratorError::Filesystem(format!(
                "executable '{}' not found under {}",
                entry.exec_file,
                install_dir.display()
            ))
        })?;
        let cli_rel = match cli_rel {
            Some((target, None)) => {
                tracing::warn!("CLI '{}' for '{}' not found", target, app_id);
                None
            }
            Some((_, found)) => found,
            None => None,
        };
        checkpoint(app_id, cancel)?;

        // ── configure + persist ──
        // 여기서부터는 취소를 보지 않는다. 실패하면 이전 트리를 되돌린다
        reporter.report(InstallPhase::Configuring, 93, "Configuring");
        run_blocking({
            let install_dir = install_dir.clone();
            move || swap_in(&install_dir)
        })
        .await
        .map_err(|e| OrchestratorError::fs("swap in", &install_dir, e))?;

        let exec_path = install_dir.join(exec_rel);
        let cli_path = cli_rel.map(|rel| install_dir.join(rel));
        match self.commit(entry, version, &install_dir, &exec_path, cli_path.as_deref(), reporter) {
            Ok(row) => {
                if let Err(e) = remove_dir_if_exists(&install_dir.join(PREVIOUS_DIR)).await {
                    tracing::warn!("{}", e);
                }
                Ok(row)
            }
            Err(e) => {
                let restored = run_blocking({
                    let install_dir = install_dir.clone();
                    move || roll_back(&install_dir)
                })
                .await;
                if let Err(re) = restored {
                    tracing::warn!("Restoring previous '{}' tree failed: {}", app_id, re);
                }
                Err(e)
            }
        }
    }

    fn commit(
        &self,
        entry: &CatalogEntry,
        version: &AppVersion,
        install_dir: &Path,
        exec_path: &Path,
        cli_path: Option<&Path>,
        reporter: &ProgressReporter,
    ) -> Result<InstalledApp> {
        let app_id = entry.id.as_str();
        let family = self.families.lookup(app_id);
        let ctx = FamilyContext {
            app_id,
            install_dir,
            exec_path,
            registry: &self.registry,
        };
        family.post_install(&ctx).map_err(|e| {
            OrchestratorError::Filesystem(format!("post-install for '{}' failed: {:#}", app_id, e))
        })?;

        reporter.report(InstallPhase::Persisting, 97, "Saving");
        let previous = self.registry.get(app_id)?;
        let now = now_rfc3339();
        // 재설치는 사용자가 정한 값(인자, 자동 시작, 대시보드 표시)을 유지
        let row = InstalledApp {
            app_id: app_id.to_string(),
            installed_version: version.version.clone(),
            install_path: install_dir.to_string_lossy().to_string(),
            exec_path: exec_path.to_string_lossy().to_string(),
            cli_path: cli_path.map(|p| p.to_string_lossy().to_string()),
            custom_args: previous.as_ref().and_then(|p| p.custom_args.clone()),
            auto_start: previous.as_ref().map(|p| p.auto_start).unwrap_or(false),
            show_on_dashboard: previous.as_ref().map(|p| p.show_on_dashboard).unwrap_or(true),
            installed_at: previous.map(|p| p.installed_at).unwrap_or_else(|| now.clone()),
            updated_at: now,
        };
        self.registry.upsert(&row)?;

        if let Some(key) = family.default_version_key() {
            if self.registry.get_setting(key)?.is_none() {
                tracing::info!("Setting {} = {} (first install)", key, version.version);
                self.registry.set_setting(key, &version.version)?;
            }
        }

        Ok(row)
    }

    /// Advisory: a concurrent install of a sibling can race past this.
    async fn check_group(&self, entry: &CatalogEntry) -> Result<()> {
        let Some(group) = entry.group.as_deref() else {
            return Ok(());
        };
        let installed = self.registry.list()?;
        let catalog = self.catalog.read().await;
        for row in installed {
            if row.app_id == entry.id {
                continue;
            }
            let same_group = catalog
                .entry(&row.app_id)
                .map(|e| e.group.as_deref() == Some(group))
                .unwrap_or(false);
            if same_group {
                return Err(ValidationError::GroupConflict {
                    app_id: entry.id.clone(),
                    group: group.to_string(),
                    installed: row.app_id,
                }
                .into());
            }
        }
        Ok(())
    }

    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        cancel: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let extraction = self.extractor.extract(archive, dest, tx, cancel.clone());
        tokio::pin!(extraction);

        let result = loop {
            tokio::select! {
                res = &mut extraction => break res,
                Some(event) = rx.recv() => on_extract_event(reporter, event),
            }
        };
        while let Ok(event) = rx.try_recv() {
            on_extract_event(reporter, event);
        }
        result
    }

    fn finish(&self, app_id: &str, generation: u64, result: &Result<InstalledApp>, reporter: &ProgressReporter) {
        // 취소 후 새 설치가 컨텍스트를 넘겨받았으면 디렉터리는 그쪽 소유
        let owns_dir = match self.active.lock() {
            Ok(mut map) => match map.get(app_id).map(|c| c.generation) {
                Some(g) if g == generation => {
                    map.remove(app_id);
                    true
                }
                Some(_) => false,
                None => true,
            },
            Err(_) => true,
        };

        let install_dir = self.install_dir(app_id);
        if owns_dir {
            remove_dir_best_effort(&install_dir.join(DOWNLOAD_DIR));
            remove_dir_best_effort(&install_dir.join(STAGING_DIR));
        }

        match result {
            Ok(row) => {
                tracing::info!("Installed {} {} -> {}", app_id, row.installed_version, row.exec_path);
                reporter.report(InstallPhase::Done, 100, "Installed");
            }
            Err(e) if e.is_cancelled() => {
                // 기존 설치가 없을 때만 루트까지 지운다
                let fresh = matches!(self.registry.get(app_id), Ok(None));
                if owns_dir && fresh {
                    remove_dir_best_effort(&install_dir);
                }
                reporter.report(InstallPhase::Cancelled, 0, "Cancelled");
            }
            Err(e) => {
                tracing::error!("Install of '{}' failed: {}", app_id, e);
                reporter.report(InstallPhase::Failed, 0, "Failed");
                reporter.detail("Failed", e.to_string());
            }
        }
    }
}

fn on_extract_event(reporter: &ProgressReporter, event: ExtractEvent) {
    match event {
        ExtractEvent::Start { .. } => {
            reporter.report(InstallPhase::Extracting, 50, "Extracting");
        }
        ExtractEvent::Progress { extracted, total } => {
            reporter.report(InstallPhase::Extracting, extract_progress(extracted, total), "Extracting");
        }
        ExtractEvent::Warning { entry, message } => {
            reporter.detail("Extracting", format!("Skipped {}: {}", entry, message));
        }
        ExtractEvent::Complete => {
            reporter.report(InstallPhase::Extracting, 90, "Extracted");
        }
    }
}

fn checkpoint(app_id: &str, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(OrchestratorError::Cancelled(app_id.to_string()))
    } else {
        Ok(())
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(OrchestratorError::fs("remove", path, e)),
    }
}

async fn run_blocking<F>(f: F) -> std::io::Result<()>
where
    F: FnOnce() -> std::io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

/// Top-level entries of the install root, excluding pipeline work directories.
fn live_entries(install_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(install_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if !WORK_DIRS.iter().any(|w| name == *w) {
            out.push(entry.path());
        }
    }
    Ok(out)
}

fn move_children(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        std::fs::rename(entry.path(), to.join(entry.file_name()))?;
    }
    Ok(())
}

/// Park the current tree in `.previous` and move the staged tree into the root.
fn swap_in(install_dir: &Path) -> std::io::Result<()> {
    let previous = install_dir.join(PREVIOUS_DIR);
    std::fs::create_dir_all(&previous)?;
    let swapped = (|| {
        for path in live_entries(install_dir)? {
            if let Some(name) = path.file_name() {
                std::fs::rename(&path, previous.join(name))?;
            }
        }
        let staging = install_dir.join(STAGING_DIR);
        move_children(&staging, install_dir)?;
        std::fs::remove_dir(&staging)
    })();
    if swapped.is_err() {
        let _ = roll_back(install_dir);
    }
    swapped
}

/// Drop whatever the swap moved in and put `.previous` back.
fn roll_back(install_dir: &Path) -> std::io::Result<()> {
    for path in live_entries(install_dir)? {
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    let previous = install_dir.join(PREVIOUS_DIR);
    if previous.exists() {
        move_children(&previous, install_dir)?;
        std::fs::remove_dir(&previous)?;
    }
    Ok(())
}

/// Cleanup never escalates; failures are only logged.
pub(crate) fn remove_dir_best_effort(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(path) {
        tracing::warn!("Failed to remove {}: {}", path.display(), e);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::catalog::CatalogDocument;
    use async_trait::async_trait;

    pub fn catalog_document() -> CatalogDocument {
        serde_json::from_str(
            r#"{
                "version": "1",
                "apps": [
                    {"id": "nginx", "name": "Nginx", "group": "webserver", "exec_file": "nginx.exe",
                     "versions": [
                        {"version": "1.28.1", "filename": "nginx-1.28.1.zip", "download_url": "mem://nginx-1.28.1.zip"},
                        {"version": "1.27.0", "filename": "nginx-1.27.0.zip", "download_url": "mem://nginx-1.27.0.zip"}
                     ]},
                    {"id": "apache", "name": "Apache", "group": "webserver", "exec_file": "bin/httpd.exe",
                     "versions": [
                        {"version": "2.4.62", "filename": "httpd-2.4.62-win64.zip", "download_url": "mem://httpd-2.4.62-win64.zip"}
                     ]},
                    {"id": "php", "name": "PHP", "exec_file": "php-cgi.exe",
                     "versions": [
                        {"version": "8.3.10", "filename": "php-8.3.10.zip", "download_url": "mem://php-8.3.10.zip"},
                        {"version": "8.2.22", "filename": "php-8.2.22.zip", "download_url": "mem://php-8.2.22.zip"}
                     ]}
                ]
            }"#,
        )
        .unwrap()
    }

    pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        extract::test_support::write_zip(&path, entries);
        std::fs::read(path).unwrap()
    }

    /// Writes one file into `dest`, then blocks until cancelled.
    #[derive(Default)]
    pub struct StallingExtractor {
        pub started: tokio::sync::Notify,
    }

    #[async_trait]
    impl Extractor for StallingExtractor {
        async fn extract(
            &self,
            archive: &Path,
            dest: &Path,
            events: extract::ExtractEvents,
            cancel: CancellationToken,
        ) -> Result<()> {
            std::fs::create_dir_all(dest)?;
            std::fs::write(dest.join("partial.bin"), b"x")?;
            let _ = events.send(ExtractEvent::Start { total: 10 });
            let _ = events.send(ExtractEvent::Progress { extracted: 1, total: 10 });
            self.started.notify_one();
            cancel.cancelled().await;
            Err(OrchestratorError::Cancelled(archive.display().to_string()))
        }
    }

    pub struct Harness {
        pub dir: tempfile::TempDir,
        pub registry: Arc<InstallRegistry>,
        pub pipeline: Arc<InstallPipeline>,
    }

    impl Harness {
        pub fn new(source: Arc<dyn ArchiveSource>, extractor: Arc<dyn Extractor>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let catalog = Catalog::new(dir.path().join("catalog.json"), catalog_document());
            let registry = Arc::new(InstallRegistry::open_in_memory().unwrap());
            let pipeline = Arc::new(InstallPipeline::new(
                dir.path().join("apps"),
                Arc::new(RwLock::new(catalog)),
                registry.clone(),
                Arc::new(FamilyTable::builtin()),
                source,
                extractor,
            ));
            Self { dir, registry, pipeline }
        }

        pub fn app_dir(&self, app_id: &str) -> PathBuf {
            self.dir.path().join("apps").join(app_id)
        }
    }
}

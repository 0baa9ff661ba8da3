//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use devstack_core::catalog::{Catalog, CatalogDocument};
use devstack_core::config::GlobalConfig;
use devstack_core::hosts::{FileHostsEditor, HostsEditor};
use devstack_core::install::download::{ArchiveSource, DownloadOutcome, ProgressFn};
use devstack_core::install::extract::{ExtractEvent, ExtractEvents};
use devstack_core::install::{ArchiveExtractor, Extractor};
use devstack_core::registry::InstallRegistry;
use devstack_core::{Orchestrator, OrchestratorError, Result};

pub const CATALOG: &str = r#"{
    "version": "1",
    "apps": [
        {"id": "nginx", "name": "Nginx", "group": "webserver", "exec_file": "nginx.exe",
         "versions": [
            {"version": "1.28.1", "filename": "nginx-1.28.1.zip", "download_url": "mock://nginx-1.28.1.zip"},
            {"version": "1.27.0", "filename": "nginx-1.27.0.zip", "download_url": "mock://nginx-1.27.0.zip"}
         ]},
        {"id": "apache", "name": "Apache", "group": "webserver", "exec_file": "bin/httpd.exe",
         "versions": [
            {"version": "2.4.62", "filename": "httpd-2.4.62-win64.zip", "download_url": "mock://httpd-2.4.62-win64.zip"}
         ]},
        {"id": "nvm", "name": "NVM", "exec_file": "nvm.exe",
         "versions": [
            {"version": "1.1.12", "filename": "nvm-1.1.12.zip", "download_url": "mock://nvm-1.1.12.zip"}
         ]}
    ]
}"#;

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::FileOptions::default();
        for (name, data) in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, options).unwrap();
            } else {
                zip.start_file(*name, options).unwrap();
                zip.write_all(data).unwrap();
            }
        }
        zip.finish().unwrap();
    }
    cursor.into_inner()
}

pub fn nginx_zip() -> Vec<u8> {
    zip_bytes(&[
        ("nginx-1.28.1/", b""),
        ("nginx-1.28.1/nginx.exe", b"MZ"),
        ("nginx-1.28.1/conf/mime.types", b"types {}"),
    ])
}

/// Serves archives from memory.
#[derive(Default)]
pub struct MockSource {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockSource {
    pub fn insert(&self, url: &str, data: Vec<u8>) {
        self.files.lock().unwrap().insert(url.to_string(), data);
    }
}

#[async_trait]
impl ArchiveSource for MockSource {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        let data = self.files.lock().unwrap().get(url).cloned().unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled(url.to_string()));
        }
        tokio::fs::write(dest, &data).await?;
        progress(data.len() as u64, Some(data.len() as u64));
        Ok(DownloadOutcome {
            bytes: data.len() as u64,
            sha1: hex::encode(Sha1::digest(&data)),
        })
    }
}

/// Writes a partial archive and waits for cancellation.
#[derive(Default)]
pub struct StallingSource {
    pub started: Notify,
}

#[async_trait]
impl ArchiveSource for StallingSource {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        tokio::fs::write(dest, b"PK partial").await?;
        progress(10, Some(10_000));
        self.started.notify_one();
        cancel.cancelled().await;
        Err(OrchestratorError::Cancelled(url.to_string()))
    }
}

/// Extracts one file and waits for cancellation.
#[derive(Default)]
pub struct StallingExtractor {
    pub started: Notify,
}

#[async_trait]
impl Extractor for StallingExtractor {
    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        events: ExtractEvents,
        cancel: CancellationToken,
    ) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join("half-extracted.dll"), b"x")?;
        let _ = events.send(ExtractEvent::Start { total: 4 });
        let _ = events.send(ExtractEvent::Progress { extracted: 1, total: 4 });
        self.started.notify_one();
        cancel.cancelled().await;
        Err(OrchestratorError::Cancelled(archive.display().to_string()))
    }
}

pub struct Stack {
    pub dir: tempfile::TempDir,
    pub config: GlobalConfig,
    pub orchestrator: Arc<Orchestrator>,
}

impl Stack {
    pub fn new(source: Arc<dyn ArchiveSource>, extractor: Arc<dyn Extractor>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GlobalConfig::with_data_root(dir.path());
        config.timeouts.start_grace_ms = 300;
        config.timeouts.stop_command_secs = 1;
        config.timeouts.auto_start_stagger_ms = 20;
        let hosts_path = dir.path().join("hosts");
        config.hosts_file = Some(hosts_path.clone());

        let doc: CatalogDocument = serde_json::from_str(CATALOG).unwrap();
        let hosts: Arc<dyn HostsEditor> = Arc::new(FileHostsEditor::new(hosts_path));
        let orchestrator = Orchestrator::with_components(
            &config,
            Catalog::new(config.catalog_path(), doc),
            Arc::new(InstallRegistry::open(&config.registry_path()).unwrap()),
            source,
            extractor,
            hosts,
        )
        .unwrap();
        Self {
            dir,
            config,
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn with_mock(source: MockSource) -> Self {
        Self::new(Arc::new(source), Arc::new(ArchiveExtractor::builtin()))
    }

    pub fn app_dir(&self, app_id: &str) -> PathBuf {
        self.config.apps_dir().join(app_id)
    }
}

/// Executable shell script whose name is unique to this test process.
#[cfg(unix)]
pub fn script(dir: &Path, tag: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(format!("it-{}-{}.sh", tag, std::process::id()));
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(50));
    path
}

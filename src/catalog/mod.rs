//! Local catalog of installable apps (`catalog.json`).
//!
//! The resolver refreshes `versions` and `lastUpdated`; every other field is
//! static metadata shipped with the catalog and never touched by a refresh.

pub mod resolver;
pub mod version;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result, ValidationError};

pub use resolver::CatalogResolver;
pub use version::compare_versions;

/// One downloadable build of an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppVersion {
    pub version: String,
    pub filename: String,
    pub download_url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub sha1: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    /// Exclusive group tag; at most one app per group may be installed.
    #[serde(default)]
    pub group: Option<String>,
    /// Target executable, possibly with a directory suffix (`bin/mysqld.exe`).
    pub exec_file: String,
    #[serde(default)]
    pub cli_file: Option<String>,
    #[serde(default)]
    pub default_args: String,
    #[serde(default)]
    pub versions: Vec<AppVersion>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub version: String,
    #[serde(rename = "lastUpdated", default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub apps: Vec<CatalogEntry>,
}

/// 카탈로그 저장소 - catalog.json 관리
pub struct Catalog {
    file_path: PathBuf,
    document: CatalogDocument,
}

impl Catalog {
    pub fn new(file_path: impl Into<PathBuf>, document: CatalogDocument) -> Self {
        Self {
            file_path: file_path.into(),
            document,
        }
    }

    /// A missing file yields an empty catalog; a malformed one is an error.
    pub fn load(file_path: impl Into<PathBuf>) -> Result<Self> {
        let file_path = file_path.into();
        if !file_path.exists() {
            tracing::info!("Catalog {} does not exist, starting empty", file_path.display());
            return Ok(Self::new(file_path, CatalogDocument::default()));
        }
        let content = fs::read_to_string(&file_path)
            .map_err(|e| OrchestratorError::fs("read", &file_path, e))?;
        let document: CatalogDocument = serde_json::from_str(&content)?;
        tracing::info!("Loaded catalog with {} apps", document.apps.len());
        Ok(Self::new(file_path, document))
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent).map_err(|e| OrchestratorError::fs("create", parent, e))?;
        }
        let content = serde_json::to_string_pretty(&self.document)?;
        fs::write(&self.file_path, content).map_err(|e| OrchestratorError::fs("write", &self.file_path, e))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn document(&self) -> &CatalogDocument {
        &self.document
    }

    pub fn apps(&self) -> &[CatalogEntry] {
        &self.document.apps
    }

    pub fn entry(&self, app_id: &str) -> Result<&CatalogEntry> {
        self.document
            .apps
            .iter()
            .find(|a| a.id == app_id)
            .ok_or_else(|| ValidationError::UnknownApp(app_id.to_string()).into())
    }

    /// Versions are kept sorted newest first, so the first one is the latest.
    pub fn latest(&self, app_id: &str) -> Result<&AppVersion> {
        self.entry(app_id)?
            .versions
            .first()
            .ok_or_else(|| ValidationError::UnknownVersion {
                app_id: app_id.to_string(),
                version: "latest".to_string(),
            }.into())
    }

    pub fn version(&self, app_id: &str, version: &str) -> Result<&AppVersion> {
        let versions = &self.entry(app_id)?.versions;
        versions
            .iter()
            .find(|v| v.version == version)
            .or_else(|| versions.iter().find(|v| compare_versions(&v.version, version).is_eq()))
            .ok_or_else(|| ValidationError::UnknownVersion {
                app_id: app_id.to_string(),
                version: version.to_string(),
            }.into())
    }

    /// Replace every entry's `versions` from `resolved`, keeping static metadata.
    ///
    /// Apps in `resolved` that the catalog does not know are ignored; apps the
    /// manifest no longer lists keep their previous versions.
    pub fn merge_versions(&mut self, resolved: &std::collections::HashMap<String, Vec<AppVersion>>) -> usize {
        let mut updated = 0;
        for entry in &mut self.document.apps {
            if let Some(versions) = resolved.get(&entry.id) {
                entry.versions = versions.clone();
                updated += 1;
            }
        }
        self.document.last_updated = Some(crate::utils::now_rfc3339());
        updated
    }
}

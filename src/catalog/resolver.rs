//! Remote manifest → catalog versions.
//!
//! ## Manifest format
//! ```xml
//! <files>
//!   <file name="nginx/nginx-1.28.1.zip">
//!     <size>1843212</size>
//!     <md5>...</md5>
//!     <sha1>...</sha1>
//!   </file>
//! </files>
//! ```
//! The first path segment is the app id; the version comes from the file name
//! through a per-app pattern table, with a generic dotted-triplet fallback.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use super::version::sort_descending;
use super::{AppVersion, Catalog};
use crate::error::{NetworkError, OrchestratorError, Result};

const USER_AGENT: &str = "devstack-core/0.1";

/// Suffixes of manifest entries that are never installable archives.
const SKIPPED_SUFFIXES: &[&str] = &[
    ".torrent", ".md5", ".sha1", ".sha256", ".asc", ".sig", ".txt", ".json", ".xml",
];

const VERSION_PATTERNS: &[(&str, &str)] = &[
    ("nginx", r"(?i)nginx-(\d+\.\d+\.\d+)"),
    ("apache", r"(?i)httpd-(\d+\.\d+\.\d+)"),
    ("mysql", r"(?i)mysql-(\d+\.\d+\.\d+)"),
    ("mariadb", r"(?i)mariadb-(\d+\.\d+\.\d+)"),
    ("postgresql", r"(?i)postgresql-(\d+\.\d+(?:\.\d+)?)"),
    ("mongodb", r"(?i)mongodb-[a-z0-9_-]*?-(\d+\.\d+\.\d+)"),
    ("redis", r"(?i)redis-(?:windows-)?(\d+\.\d+\.\d+)"),
    ("php", r"(?i)php-(\d+\.\d+\.\d+)"),
    ("nodejs", r"(?i)node-v(\d+\.\d+\.\d+)"),
    ("phpmyadmin", r"(?i)phpmyadmin-(\d+\.\d+\.\d+)"),
];

fn version_patterns() -> &'static HashMap<&'static str, Regex> {
    static PATTERNS: OnceLock<HashMap<&'static str, Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        VERSION_PATTERNS
            .iter()
            .filter_map(|(id, pat)| Regex::new(pat).ok().map(|re| (*id, re)))
            .collect()
    })
}

fn generic_pattern() -> Option<&'static Regex> {
    static GENERIC: OnceLock<Option<Regex>> = OnceLock::new();
    GENERIC.get_or_init(|| Regex::new(r"(\d+\.\d+\.\d+)").ok()).as_ref()
}

/// Extract the version embedded in `filename` for `app_id`.
pub fn extract_version(app_id: &str, filename: &str) -> Option<String> {
    let re = version_patterns().get(app_id).or_else(generic_pattern)?;
    re.captures(filename)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Summary of one refresh, returned to the caller.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RefreshSummary {
    pub apps_seen: usize,
    pub apps_updated: usize,
    pub last_updated: Option<String>,
}

pub struct CatalogResolver {
    http: reqwest::Client,
    manifest_url: String,
    download_base_url: String,
    timeout: Duration,
}

impl CatalogResolver {
    pub fn new(manifest_url: &str, download_base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(1))
            .build()
            .map_err(|e| NetworkError::Connection(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            manifest_url: manifest_url.to_string(),
            download_base_url: download_base_url.to_string(),
            timeout,
        })
    }

    /// Fetch the manifest, merge its versions into `catalog` and persist it.
    ///
    /// Any network or parse failure returns before the catalog is touched.
    pub async fn refresh(&self, catalog: &mut Catalog) -> Result<RefreshSummary> {
        tracing::info!("Refreshing catalog from {}", self.manifest_url);
        let xml = self.fetch_manifest().await?;
        let resolved = parse_manifest(&xml, &self.download_base_url)?;

        let apps_updated = catalog.merge_versions(&resolved);
        catalog.save()?;

        tracing::info!(
            "Catalog refreshed: {} apps in manifest, {} catalog entries updated",
            resolved.len(),
            apps_updated
        );
        Ok(RefreshSummary {
            apps_seen: resolved.len(),
            apps_updated,
            last_updated: catalog.document().last_updated.clone(),
        })
    }

    async fn fetch_manifest(&self) -> Result<String> {
        let secs = self.timeout.as_secs();
        let response = self
            .http
            .get(&self.manifest_url)
            .send()
            .await
            .map_err(|e| NetworkError::from_reqwest(&e, "fetch manifest", secs))?;

        if !response.status().is_success() {
            return Err(NetworkError::Status {
                status: response.status().as_u16(),
                url: self.manifest_url.clone(),
            }
            .into());
        }

        response
            .text()
            .await
            .map_err(|e| NetworkError::from_reqwest(&e, "read manifest", secs).into())
    }
}

/// Parse manifest XML into `app id → versions (newest first)`.
pub fn parse_manifest(xml: &str, download_base_url: &str) -> Result<HashMap<String, Vec<AppVersion>>> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| OrchestratorError::from(NetworkError::InvalidManifest(e.to_string())))?;

    let mut apps: HashMap<String, Vec<AppVersion>> = HashMap::new();

    for node in doc.descendants().filter(|n| n.has_tag_name("file")) {
        let Some(name) = node.attribute("name") else {
            continue;
        };
        let path = name.trim_start_matches('/');
        let lower = path.to_lowercase();
        if SKIPPED_SUFFIXES.iter().any(|s| lower.ends_with(s)) {
            continue;
        }
        if path.split('/').any(|seg| seg.starts_with('.')) {
            continue;
        }
        let Some((first, _)) = path.split_once('/') else {
            continue;
        };
        let app_id = first.to_lowercase();
        let filename = path.rsplit('/').next().unwrap_or(path).to_string();

        let Some(version) = extract_version(&app_id, &filename) else {
            tracing::debug!("No version in manifest entry '{}', skipping", name);
            continue;
        };

        let child_text = |tag: &str| {
            node.children()
                .find(|c| c.has_tag_name(tag))
                .and_then(|c| c.text())
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
        };

        apps.entry(app_id).or_default().push(AppVersion {
            version,
            filename,
            download_url: format!("{}{}", download_base_url, path),
            size: child_text("size").and_then(|s| s.parse().ok()).unwrap_or(0),
            md5: child_text("md5"),
            sha1: child_text("sha1"),
        });
    }

    for versions in apps.values_mut() {
        sort_descending(versions, |v| v.version.as_str());
    }
    Ok(apps)
}

//! Per-app-family capabilities.
//!
//! Post-install configuration, one-time data-directory initialization and
//! start/stop defaults differ per vendor. Each family implements [`AppFamily`]
//! and is registered once in [`FamilyTable::builtin`]; callers look it up by
//! app id (longest registered prefix wins, so `phpmyadmin` never resolves to
//! `php`). Unknown ids get [`GenericFamily`].

mod admin;
mod database;
mod runtime;
mod web;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::registry::InstallRegistry;

pub use admin::PhpMyAdminFamily;
pub use database::{MongoFamily, MysqlFamily, PostgresFamily, RedisFamily};
pub use runtime::{NodeFamily, PhpFamily};
pub use web::{ApacheFamily, NginxFamily};

/// Everything a hook needs to know about one installed app.
pub struct FamilyContext<'a> {
    pub app_id: &'a str,
    pub install_dir: &'a Path,
    pub exec_path: &'a Path,
    pub registry: &'a InstallRegistry,
}

impl<'a> FamilyContext<'a> {
    /// Directory the vendor layout is rooted at: the executable's directory,
    /// or its parent when the executable sits in `bin/`.
    pub fn app_root(&self) -> PathBuf {
        let parent = self.exec_path.parent().unwrap_or(self.install_dir);
        match parent.file_name().and_then(|n| n.to_str()) {
            Some(name) if name.eq_ignore_ascii_case("bin") => {
                parent.parent().unwrap_or(parent).to_path_buf()
            }
            _ => parent.to_path_buf(),
        }
    }

    /// Read a setting, falling back to `default` when unset or unreadable.
    pub fn setting_or(&self, key: &str, default: &str) -> String {
        match self.registry.get_setting(key) {
            Ok(Some(v)) => v,
            Ok(None) => default.to_string(),
            Err(e) => {
                tracing::warn!("Could not read setting '{}': {}", key, e);
                default.to_string()
            }
        }
    }
}

/// A vendor utility run once, before the first start, to create a data directory.
#[derive(Debug, Clone, PartialEq)]
pub struct InitPlan {
    /// `None` when creating the directory (and config) is all that is needed.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    /// Generated default config written before the program runs.
    pub config: Option<(PathBuf, String)>,
}

pub trait AppFamily: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs once after the executable is located, before the registry row is written.
    fn post_install(&self, _ctx: &FamilyContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Subdirectories of the app root that must exist before every start.
    fn runtime_dirs(&self) -> &'static [&'static str] {
        &[]
    }

    /// Data directory whose absence triggers [`AppFamily::init_plan`].
    fn data_dir(&self, _ctx: &FamilyContext<'_>) -> Option<PathBuf> {
        None
    }

    fn init_plan(&self, _ctx: &FamilyContext<'_>) -> Option<InitPlan> {
        None
    }

    fn default_start_args(&self, _ctx: &FamilyContext<'_>) -> Option<String> {
        None
    }

    /// Arguments for a vendor stop command (`nginx -s stop`); `None` means kill.
    fn stop_args(&self) -> Option<&'static str> {
        None
    }

    /// Settings key holding the family's default version, if it has one.
    fn default_version_key(&self) -> Option<&'static str> {
        None
    }

    /// Reverse proxies own virtual-host records that uninstall must purge.
    fn is_reverse_proxy(&self) -> bool {
        false
    }

    /// React to a changed setting. Returns whether anything was rewritten.
    fn reconfigure(&self, _ctx: &FamilyContext<'_>, _changed_key: &str) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Fallback for apps with no vendor-specific behavior.
pub struct GenericFamily;

impl AppFamily for GenericFamily {
    fn name(&self) -> &'static str {
        "generic"
    }
}

pub struct FamilyTable {
    entries: Vec<(&'static str, Arc<dyn AppFamily>)>,
    generic: Arc<dyn AppFamily>,
}

impl FamilyTable {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            generic: Arc::new(GenericFamily),
        }
    }

    pub fn builtin() -> Self {
        let mysql: Arc<dyn AppFamily> = Arc::new(MysqlFamily::mysql());
        Self::empty()
            .register("nginx", Arc::new(NginxFamily))
            .register("apache", Arc::new(ApacheFamily))
            .register("httpd", Arc::new(ApacheFamily))
            .register("mysql", mysql)
            .register("mariadb", Arc::new(MysqlFamily::mariadb()))
            .register("postgresql", Arc::new(PostgresFamily))
            .register("mongodb", Arc::new(MongoFamily))
            .register("redis", Arc::new(RedisFamily))
            .register("php", Arc::new(PhpFamily))
            .register("nodejs", Arc::new(NodeFamily))
            .register("node", Arc::new(NodeFamily))
            .register("phpmyadmin", Arc::new(PhpMyAdminFamily))
    }

    pub fn register(mut self, prefix: &'static str, family: Arc<dyn AppFamily>) -> Self {
        self.entries.push((prefix, family));
        // longest prefix first
        self.entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    pub fn lookup(&self, app_id: &str) -> Arc<dyn AppFamily> {
        let id = app_id.to_lowercase();
        self.entries
            .iter()
            .find(|(prefix, _)| id.starts_with(prefix))
            .map(|(_, f)| f.clone())
            .unwrap_or_else(|| self.generic.clone())
    }
}

impl Default for FamilyTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Write `contents` to `path` only if nothing is there yet.
pub(crate) fn write_if_missing(path: &Path, contents: &str) -> anyhow::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    tracing::info!("Wrote default config {}", path.display());
    Ok(true)
}

pub(crate) fn ensure_dirs(root: &Path, dirs: &[&str]) -> anyhow::Result<()> {
    for dir in dirs {
        std::fs::create_dir_all(root.join(dir))?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_longest_prefix() {
        let table = FamilyTable::builtin();
        assert_eq!(table.lookup("php").name(), "php");
        assert_eq!(table.lookup("php74").name(), "php");
        assert_eq!(table.lookup("phpmyadmin").name(), "phpmyadmin");
        assert_eq!(table.lookup("MariaDB").name(), "mariadb");
        assert_eq!(table.lookup("mysql57").name(), "mysql");
        assert_eq!(table.lookup("memcached").name(), "generic");
    }

    #[test]
    fn app_root_skips_bin() {
        let fx = test_support::Fixture::new("mysql", "mysql-8.4.0-winx64/bin/mysqld.exe");
        let ctx = fx.ctx("mysql");
        assert_eq!(ctx.app_root(), fx.dir.path().join("mysql").join("mysql-8.4.0-winx64"));

        let fx = test_support::Fixture::new("nginx", "nginx-1.28.1/nginx.exe");
        assert_eq!(fx.ctx("nginx").app_root(), fx.dir.path().join("nginx").join("nginx-1.28.1"));
    }
}

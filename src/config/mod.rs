use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/global.toml";

/// Daemon configuration, read from `config/global.toml`.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    pub data_root: PathBuf,
    pub manifest_url: String,
    pub download_base_url: String,
    pub ipc_listen: String,
    pub log_buffer_lines: usize,
    /// External archiver binary. Empty string disables it.
    pub archiver: String,
    pub hosts_file: Option<PathBuf>,
    pub timeouts: TimeoutConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TimeoutConfig {
    pub manifest_secs: u64,
    pub download_secs: u64,
    pub stop_command_secs: u64,
    pub start_grace_ms: u64,
    pub auto_start_stagger_ms: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./devstack-data"),
            manifest_url: "https://mirror.devstack.local/files.xml".to_string(),
            download_base_url: "https://mirror.devstack.local/files/".to_string(),
            ipc_listen: "127.0.0.1:57480".to_string(),
            log_buffer_lines: 100,
            archiver: "7z".to_string(),
            hosts_file: None,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            manifest_secs: 15,
            download_secs: 30 * 60,
            stop_command_secs: 10,
            start_grace_ms: 1000,
            auto_start_stagger_ms: 1500,
        }
    }
}

impl TimeoutConfig {
    pub fn manifest(&self) -> Duration {
        Duration::from_secs(self.manifest_secs)
    }

    pub fn download(&self) -> Duration {
        Duration::from_secs(self.download_secs)
    }

    pub fn stop_command(&self) -> Duration {
        Duration::from_secs(self.stop_command_secs)
    }

    pub fn start_grace(&self) -> Duration {
        Duration::from_millis(self.start_grace_ms)
    }

    pub fn auto_start_stagger(&self) -> Duration {
        Duration::from_millis(self.auto_start_stagger_ms)
    }
}

impl GlobalConfig {
    /// Load from `DEVSTACK_CONFIG` or `config/global.toml`, then apply env overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("DEVSTACK_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::load_from(Path::new(&path));
        if let Ok(root) = std::env::var("DEVSTACK_DATA_ROOT") {
            cfg.data_root = PathBuf::from(root);
        }
        Ok(cfg)
    }

    /// Missing files and parse errors both fall back to defaults.
    pub fn load_from(path: &Path) -> Self {
        let s = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(_) => {
                tracing::info!("No config at {}, using defaults", path.display());
                return Self::default();
            }
        };
        Self::parse(&s).unwrap_or_else(|e| {
            tracing::warn!("Invalid config {}: {}, using defaults", path.display(), e);
            Self::default()
        })
    }

    pub fn parse(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Config rooted at `data_root` with every other key at its default.
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            ..Self::default()
        }
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.data_root.join("apps")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_root.join("catalog.json")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_root.join("registry.db")
    }

    pub fn archiver(&self) -> Option<&str> {
        let trimmed = self.archiver.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

//! Install Registry: 설치된 앱 목록과 설정 테이블 (SQLite)
//!
//! `installed_apps` 행은 설치 파이프라인이 성공했을 때만 생성됩니다 (insert-or-replace).
//! 실행 중인 Supervisor가 되돌려 쓰는 필드는 `auto_start`와 `custom_args` 뿐입니다.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{OrchestratorError, Result};

/// 설치된 앱 한 행
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledApp {
    pub app_id: String,
    pub installed_version: String,
    pub install_path: String,
    pub exec_path: String,
    pub cli_path: Option<String>,
    pub custom_args: Option<String>,
    pub auto_start: bool,
    pub show_on_dashboard: bool,
    pub installed_at: String,
    pub updated_at: String,
}

impl InstalledApp {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            app_id: row.get("app_id")?,
            installed_version: row.get("installed_version")?,
            install_path: row.get("install_path")?,
            exec_path: row.get("exec_path")?,
            cli_path: row.get("cli_path")?,
            custom_args: row.get("custom_args")?,
            auto_start: row.get::<_, i64>("auto_start")? != 0,
            show_on_dashboard: row.get::<_, i64>("show_on_dashboard")? != 0,
            installed_at: row.get("installed_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Virtual-host record owned by a reverse-proxy app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualHost {
    pub domain: String,
    pub app_id: String,
    pub document_root: String,
}

pub struct InstallRegistry {
    conn: Mutex<Connection>,
}

impl InstallRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| OrchestratorError::fs("create", parent, e))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| OrchestratorError::State(format!("failed to open registry at {}: {}", path.display(), e)))?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS installed_apps (
                app_id TEXT PRIMARY KEY,
                installed_version TEXT NOT NULL,
                install_path TEXT NOT NULL,
                exec_path TEXT NOT NULL,
                cli_path TEXT,
                custom_args TEXT,
                auto_start INTEGER NOT NULL DEFAULT 0,
                show_on_dashboard INTEGER NOT NULL DEFAULT 1,
                installed_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS vhosts (
                domain TEXT PRIMARY KEY,
                app_id TEXT NOT NULL,
                document_root TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Mutex 락 획득 헬퍼
    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| {
            tracing::error!("Registry lock poisoned: {}", e);
            OrchestratorError::State("registry lock poisoned".to_string())
        })
    }

    // ─── Installed apps ──────────────────────────────────────

    /// Insert or replace; re-installing overwrites the previous row.
    pub fn upsert(&self, app: &InstalledApp) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"INSERT OR REPLACE INTO installed_apps
               (app_id, installed_version, install_path, exec_path, cli_path, custom_args,
                auto_start, show_on_dashboard, installed_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                app.app_id,
                app.installed_version,
                app.install_path,
                app.exec_path,
                app.cli_path,
                app.custom_args,
                app.auto_start as i64,
                app.show_on_dashboard as i64,
                app.installed_at,
                app.updated_at,
            ],
        )?;
        tracing::info!("Registered {} v{}", app.app_id, app.installed_version);
        Ok(())
    }

    pub fn get(&self, app_id: &str) -> Result<Option<InstalledApp>> {
        let conn = self.lock()?;
        let app = conn
            .query_row(
                "SELECT * FROM installed_apps WHERE app_id = ?1",
                params![app_id],
                InstalledApp::from_row,
            )
            .optional()?;
        Ok(app)
    }

    pub fn list(&self) -> Result<Vec<InstalledApp>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM installed_apps ORDER BY app_id")?;
        let apps = stmt
            .query_map([], InstalledApp::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(apps)
    }

    /// 부팅 시 자동 시작 대상, app_id 순
    pub fn auto_start_apps(&self) -> Result<Vec<InstalledApp>> {
        Ok(self.list()?.into_iter().filter(|a| a.auto_start).collect())
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, app_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM installed_apps WHERE app_id = ?1", params![app_id])?;
        Ok(n > 0)
    }

    pub fn set_auto_start(&self, app_id: &str, auto_start: bool) -> Result<bool> {
        self.update_field("auto_start", app_id, &(auto_start as i64))
    }

    pub fn set_custom_args(&self, app_id: &str, custom_args: Option<&str>) -> Result<bool> {
        self.update_field("custom_args", app_id, &custom_args)
    }

    pub fn set_show_on_dashboard(&self, app_id: &str, show: bool) -> Result<bool> {
        self.update_field("show_on_dashboard", app_id, &(show as i64))
    }

    fn update_field(&self, column: &'static str, app_id: &str, value: &dyn rusqlite::ToSql) -> Result<bool> {
        let conn = self.lock()?;
        let sql = format!(
            "UPDATE installed_apps SET {} = ?1, updated_at = ?2 WHERE app_id = ?3",
            column
        );
        let n = conn.execute(&sql, params![value, crate::utils::now_rfc3339(), app_id])?;
        Ok(n > 0)
    }

    // ─── Settings ────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    // ─── Virtual hosts ───────────────────────────────────────

    pub fn add_vhost(&self, vhost: &VirtualHost) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO vhosts (domain, app_id, document_root) VALUES (?1, ?2, ?3)",
            params![vhost.domain, vhost.app_id, vhost.document_root],
        )?;
        Ok(())
    }

    pub fn vhosts_for(&self, app_id: &str) -> Result<Vec<VirtualHost>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT domain, app_id, document_root FROM vhosts WHERE app_id = ?1 ORDER BY domain")?;
        let rows = stmt
            .query_map(params![app_id], |row| {
                Ok(VirtualHost {
                    domain: row.get(0)?,
                    app_id: row.get(1)?,
                    document_root: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete every vhost owned by `app_id` and return their domains.
    pub fn remove_vhosts_for(&self, app_id: &str) -> Result<Vec<String>> {
        let domains: Vec<String> = self.vhosts_for(app_id)?.into_iter().map(|v| v.domain).collect();
        let conn = self.lock()?;
        conn.execute("DELETE FROM vhosts WHERE app_id = ?1", params![app_id])?;
        Ok(domains)
    }
}

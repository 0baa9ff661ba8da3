//! Databases: MySQL/MariaDB (group `mysql`), PostgreSQL, MongoDB, Redis.
//!
//! All of them keep data under `<app root>/data`; the first start initializes it.

use std::path::{Path, PathBuf};

use super::{write_if_missing, AppFamily, FamilyContext, InitPlan};
use crate::utils::{render_template, template_path};

const MY_INI: &str = r#"[mysqld]
basedir="{{ROOT}}"
datadir="{{DATA}}"
port={{PORT}}
bind-address=127.0.0.1
character-set-server=utf8mb4

[client]
port={{PORT}}
"#;

const MONGOD_CFG: &str = r#"storage:
  dbPath: "{{DATA}}"
net:
  bindIp: 127.0.0.1
  port: {{PORT}}
"#;

const REDIS_CONF: &str = "bind 127.0.0.1\nport {{PORT}}\ndir \"{{ROOT}}\"\n";

/// Sibling executable in the same directory as the main one (`initdb` next to `postgres`).
fn sibling(exec_path: &Path, stem: &str) -> PathBuf {
    let ext = exec_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    exec_path
        .parent()
        .unwrap_or(exec_path)
        .join(format!("{}{}", stem, ext))
}

pub struct MysqlFamily {
    mariadb: bool,
}

impl MysqlFamily {
    pub fn mysql() -> Self {
        Self { mariadb: false }
    }

    pub fn mariadb() -> Self {
        Self { mariadb: true }
    }

    fn my_ini(&self, ctx: &FamilyContext<'_>) -> (PathBuf, String) {
        let root = ctx.app_root();
        let rendered = render_template(
            MY_INI,
            &[
                ("ROOT", template_path(&root)),
                ("DATA", template_path(&root.join("data"))),
                ("PORT", ctx.setting_or("mysql.port", "3306")),
            ],
        );
        (root.join("my.ini"), rendered)
    }
}

impl AppFamily for MysqlFamily {
    fn name(&self) -> &'static str {
        if self.mariadb {
            "mariadb"
        } else {
            "mysql"
        }
    }

    fn post_install(&self, ctx: &FamilyContext<'_>) -> anyhow::Result<()> {
        let (path, content) = self.my_ini(ctx);
        write_if_missing(&path, &content)?;
        Ok(())
    }

    fn runtime_dirs(&self) -> &'static [&'static str] {
        &["tmp"]
    }

    fn data_dir(&self, ctx: &FamilyContext<'_>) -> Option<PathBuf> {
        Some(ctx.app_root().join("data"))
    }

    fn init_plan(&self, ctx: &FamilyContext<'_>) -> Option<InitPlan> {
        let root = ctx.app_root();
        let data = template_path(&root.join("data"));
        let (program, args) = if self.mariadb {
            (
                sibling(ctx.exec_path, "mysql_install_db"),
                vec![format!("--datadir={}", data)],
            )
        } else {
            (
                ctx.exec_path.to_path_buf(),
                vec![
                    "--initialize-insecure".to_string(),
                    format!("--basedir={}", template_path(&root)),
                    format!("--datadir={}", data),
                ],
            )
        };
        Some(InitPlan {
            program: Some(program),
            args,
            config: Some(self.my_ini(ctx)),
        })
    }

    fn default_start_args(&self, ctx: &FamilyContext<'_>) -> Option<String> {
        Some(format!(
            "--defaults-file=\"{}\" --console",
            template_path(&ctx.app_root().join("my.ini"))
        ))
    }

    fn reconfigure(&self, ctx: &FamilyContext<'_>, changed_key: &str) -> anyhow::Result<bool> {
        if changed_key != "mysql.port" {
            return Ok(false);
        }
        let (path, content) = self.my_ini(ctx);
        std::fs::write(path, content)?;
        Ok(true)
    }
}

pub struct PostgresFamily;

impl AppFamily for PostgresFamily {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn data_dir(&self, ctx: &FamilyContext<'_>) -> Option<PathBuf> {
        Some(ctx.app_root().join("data"))
    }

    fn init_plan(&self, ctx: &FamilyContext<'_>) -> Option<InitPlan> {
        let data = template_path(&ctx.app_root().join("data"));
        Some(InitPlan {
            program: Some(sibling(ctx.exec_path, "initdb")),
            args: ["-D", data.as_str(), "-U", "postgres", "-A", "trust", "-E", "UTF8"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            config: None,
        })
    }

    fn default_start_args(&self, ctx: &FamilyContext<'_>) -> Option<String> {
        Some(format!(
            "-D \"{}\" -p {}",
            template_path(&ctx.app_root().join("data")),
            ctx.setting_or("postgresql.port", "5432")
        ))
    }
}

pub struct MongoFamily;

impl AppFamily for MongoFamily {
    fn name(&self) -> &'static str {
        "mongodb"
    }

    fn data_dir(&self, ctx: &FamilyContext<'_>) -> Option<PathBuf> {
        Some(ctx.app_root().join("data").join("db"))
    }

    /// mongod needs no init utility, only the directory and a config file.
    fn init_plan(&self, ctx: &FamilyContext<'_>) -> Option<InitPlan> {
        let root = ctx.app_root();
        let rendered = render_template(
            MONGOD_CFG,
            &[
                ("DATA", template_path(&root.join("data").join("db"))),
                ("PORT", ctx.setting_or("mongodb.port", "27017")),
            ],
        );
        Some(InitPlan {
            program: None,
            args: Vec::new(),
            config: Some((root.join("mongod.cfg"), rendered)),
        })
    }

    fn runtime_dirs(&self) -> &'static [&'static str] {
        &["logs"]
    }

    fn default_start_args(&self, ctx: &FamilyContext<'_>) -> Option<String> {
        Some(format!(
            "--config \"{}\"",
            template_path(&ctx.app_root().join("mongod.cfg"))
        ))
    }
}

pub struct RedisFamily;

impl AppFamily for RedisFamily {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn post_install(&self, ctx: &FamilyContext<'_>) -> anyhow::Result<()> {
        let root = ctx.app_root();
        let rendered = render_template(
            REDIS_CONF,
            &[
                ("ROOT", template_path(&root)),
                ("PORT", ctx.setting_or("redis.port", "6379")),
            ],
        );
        write_if_missing(&root.join("redis.conf"), &rendered)?;
        Ok(())
    }

    fn default_start_args(&self, ctx: &FamilyContext<'_>) -> Option<String> {
        Some(format!(
            "\"{}\"",
            template_path(&ctx.app_root().join("redis.conf"))
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::test_support::Fixture;

    #[test]
    fn mysql_init_plan_uses_mysqld_initialize() {
        let fx = Fixture::new("mysql", "mysql-8.4.0-winx64/bin/mysqld.exe");
        fx.registry.set_setting("mysql.port", "3307").unwrap();
        let ctx = fx.ctx("mysql");
        let family = MysqlFamily::mysql();

        let plan = family.init_plan(&ctx).unwrap();
        assert_eq!(plan.program.as_deref(), Some(fx.exec_path.as_path()));
        assert_eq!(plan.args[0], "--initialize-insecure");
        let (ini_path, ini) = plan.config.unwrap();
        assert_eq!(ini_path, ctx.app_root().join("my.ini"));
        assert!(ini.contains("port=3307"));
        assert_eq!(family.data_dir(&ctx).unwrap(), ctx.app_root().join("data"));
    }

    #[test]
    fn mariadb_uses_install_db_sibling() {
        let fx = Fixture::new("mariadb", "mariadb-11.4/bin/mariadbd.exe");
        let plan = MysqlFamily::mariadb().init_plan(&fx.ctx("mariadb")).unwrap();
        let program = plan.program.unwrap();
        assert_eq!(program.file_name().unwrap(), "mysql_install_db.exe");
        assert_eq!(program.parent(), fx.exec_path.parent());
    }

    #[test]
    fn mysql_post_install_keeps_existing_ini() {
        let fx = Fixture::new("mysql", "m/bin/mysqld");
        let ctx = fx.ctx("mysql");
        let ini = ctx.app_root().join("my.ini");
        std::fs::write(&ini, "[mysqld]\nport=4000\n").unwrap();
        MysqlFamily::mysql().post_install(&ctx).unwrap();
        assert_eq!(std::fs::read_to_string(&ini).unwrap(), "[mysqld]\nport=4000\n");

        // 포트 설정 변경은 덮어씀
        fx.registry.set_setting("mysql.port", "3310").unwrap();
        assert!(MysqlFamily::mysql().reconfigure(&ctx, "mysql.port").unwrap());
        assert!(std::fs::read_to_string(&ini).unwrap().contains("port=3310"));
    }

    #[test]
    fn postgres_initdb_next_to_postgres() {
        let fx = Fixture::new("postgresql", "pgsql/bin/postgres.exe");
        let ctx = fx.ctx("postgresql");
        let plan = PostgresFamily.init_plan(&ctx).unwrap();
        assert_eq!(plan.program.unwrap().file_name().unwrap(), "initdb.exe");
        assert!(plan.args.contains(&"trust".to_string()));
        assert!(PostgresFamily.default_start_args(&ctx).unwrap().contains("-p 5432"));
    }

    #[test]
    fn mongo_init_is_config_only() {
        let fx = Fixture::new("mongodb", "mongodb/bin/mongod.exe");
        let plan = MongoFamily.init_plan(&fx.ctx("mongodb")).unwrap();
        assert!(plan.program.is_none());
        assert!(plan.config.unwrap().1.contains("port: 27017"));
    }
}

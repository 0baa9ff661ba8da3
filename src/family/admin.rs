//! phpMyAdmin: a PHP web app whose config follows the installed MySQL port.

use std::path::PathBuf;

use super::{AppFamily, FamilyContext};
use crate::utils::render_template;

const CONFIG_INC: &str = r#"<?php
$cfg['blowfish_secret'] = '{{SECRET}}';
$i = 0;
$i++;
$cfg['Servers'][$i]['auth_type'] = 'cookie';
$cfg['Servers'][$i]['host'] = '127.0.0.1';
$cfg['Servers'][$i]['port'] = '{{PORT}}';
$cfg['Servers'][$i]['AllowNoPassword'] = true;
$cfg['UploadDir'] = '';
$cfg['SaveDir'] = '';
"#;

pub struct PhpMyAdminFamily;

impl PhpMyAdminFamily {
    fn config_path(ctx: &FamilyContext<'_>) -> PathBuf {
        ctx.app_root().join("config.inc.php")
    }

    /// Keep the previous secret on rewrite so existing login cookies stay valid.
    fn existing_secret(path: &std::path::Path) -> Option<String> {
        let content = std::fs::read_to_string(path).ok()?;
        let start = content.find("$cfg['blowfish_secret'] = '")? + "$cfg['blowfish_secret'] = '".len();
        let end = content[start..].find('\'')?;
        Some(content[start..start + end].to_string())
    }

    /// blowfish_secret는 32자. v4 UUID의 122비트 난수를 hex로 쓴다.
    fn new_secret() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    fn write_config(ctx: &FamilyContext<'_>) -> anyhow::Result<()> {
        let path = Self::config_path(ctx);
        let secret = Self::existing_secret(&path).unwrap_or_else(Self::new_secret);
        let rendered = render_template(
            CONFIG_INC,
            &[
                ("SECRET", secret),
                ("PORT", ctx.setting_or("mysql.port", "3306")),
            ],
        );
        std::fs::write(&path, rendered)?;
        Ok(())
    }
}

impl AppFamily for PhpMyAdminFamily {
    fn name(&self) -> &'static str {
        "phpmyadmin"
    }

    fn post_install(&self, ctx: &FamilyContext<'_>) -> anyhow::Result<()> {
        Self::write_config(ctx)
    }

    fn reconfigure(&self, ctx: &FamilyContext<'_>, changed_key: &str) -> anyhow::Result<bool> {
        if changed_key != "mysql.port" {
            return Ok(false);
        }
        Self::write_config(ctx)?;
        Ok(true)
    }
}

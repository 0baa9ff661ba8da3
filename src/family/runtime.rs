//! Language runtimes: PHP (FastCGI) and Node.js.

use regex::Regex;

use super::{AppFamily, FamilyContext};
use crate::utils::template_path;

pub struct PhpFamily;

impl AppFamily for PhpFamily {
    fn name(&self) -> &'static str {
        "php"
    }

    /// Seed `php.ini` from the shipped `php.ini-development` and point `extension_dir` at `ext/`.
    fn post_install(&self, ctx: &FamilyContext<'_>) -> anyhow::Result<()> {
        let root = ctx.app_root();
        let ini = root.join("php.ini");
        if ini.exists() {
            return Ok(());
        }
        let template = root.join("php.ini-development");
        let content = if template.exists() {
            std::fs::read_to_string(&template)?
        } else {
            String::from("[PHP]\n;extension_dir = \"ext\"\n")
        };

        let re = Regex::new(r#"(?m)^;?\s*extension_dir\s*=\s*"ext"\s*$"#)?;
        let line = format!("extension_dir = \"{}\"", template_path(&root.join("ext")));
        let updated = re.replacen(&content, 1, regex::NoExpand(&line));
        std::fs::write(&ini, updated.as_ref())?;
        tracing::info!("Created {}", ini.display());
        Ok(())
    }

    fn default_start_args(&self, ctx: &FamilyContext<'_>) -> Option<String> {
        Some(format!("-b 127.0.0.1:{}", ctx.setting_or("php.port", "9000")))
    }

    fn default_version_key(&self) -> Option<&'static str> {
        Some("php.default_version")
    }

    /// 포트는 시작 인자로만 전달되므로 다시 쓸 파일은 없고 재시작만 필요하다.
    fn reconfigure(&self, _ctx: &FamilyContext<'_>, changed_key: &str) -> anyhow::Result<bool> {
        Ok(changed_key == "php.port")
    }
}

pub struct NodeFamily;

impl AppFamily for NodeFamily {
    fn name(&self) -> &'static str {
        "nodejs"
    }

    fn default_version_key(&self) -> Option<&'static str> {
        Some("nodejs.default_version")
    }
}

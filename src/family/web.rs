//! Web servers: nginx and Apache httpd (group `webserver`).

use regex::Regex;
use std::path::PathBuf;

use super::{ensure_dirs, write_if_missing, AppFamily, FamilyContext};
use crate::utils::{render_template, template_path};

const NGINX_CONF: &str = r#"worker_processes  1;

events {
    worker_connections  1024;
}

http {
    include       mime.types;
    default_type  application/octet-stream;
    sendfile      on;

    include       php_upstream.conf;

    server {
        listen       {{HTTP_PORT}};
        server_name  localhost;
        root         "{{ROOT}}/html";
        index        index.html index.php;

        location ~ \.php$ {
            fastcgi_pass   php_backend;
            fastcgi_param  SCRIPT_FILENAME  $document_root$fastcgi_script_name;
            include        fastcgi_params;
        }
    }

    include       vhosts/*.conf;
}
"#;

const PHP_UPSTREAM_CONF: &str = "upstream php_backend {\n    server 127.0.0.1:{{PHP_PORT}};\n}\n";

pub struct NginxFamily;

impl NginxFamily {
    fn conf_dir(ctx: &FamilyContext<'_>) -> PathBuf {
        ctx.app_root().join("conf")
    }

    fn write_php_upstream(ctx: &FamilyContext<'_>) -> anyhow::Result<()> {
        let php_port = ctx.setting_or("php.port", "9000");
        let path = Self::conf_dir(ctx).join("php_upstream.conf");
        std::fs::create_dir_all(Self::conf_dir(ctx))?;
        std::fs::write(&path, render_template(PHP_UPSTREAM_CONF, &[("PHP_PORT", php_port)]))?;
        Ok(())
    }
}

impl AppFamily for NginxFamily {
    fn name(&self) -> &'static str {
        "nginx"
    }

    fn post_install(&self, ctx: &FamilyContext<'_>) -> anyhow::Result<()> {
        let root = ctx.app_root();
        ensure_dirs(&root, self.runtime_dirs())?;
        std::fs::create_dir_all(root.join("html"))?;

        // 배포본의 nginx.conf는 php/vhosts include가 없으므로 교체
        let conf = Self::conf_dir(ctx).join("nginx.conf");
        let rendered = render_template(
            NGINX_CONF,
            &[
                ("ROOT", template_path(&root)),
                ("HTTP_PORT", ctx.setting_or("nginx.port", "80")),
            ],
        );
        std::fs::create_dir_all(Self::conf_dir(ctx))?;
        std::fs::write(&conf, rendered)?;
        Self::write_php_upstream(ctx)
    }

    fn runtime_dirs(&self) -> &'static [&'static str] {
        &["logs", "temp", "conf/vhosts"]
    }

    fn stop_args(&self) -> Option<&'static str> {
        Some("-s stop")
    }

    fn is_reverse_proxy(&self) -> bool {
        true
    }

    fn reconfigure(&self, ctx: &FamilyContext<'_>, changed_key: &str) -> anyhow::Result<bool> {
        if changed_key != "php.port" && changed_key != "php.default_version" {
            return Ok(false);
        }
        Self::write_php_upstream(ctx)?;
        Ok(true)
    }
}

pub struct ApacheFamily;

impl AppFamily for ApacheFamily {
    fn name(&self) -> &'static str {
        "apache"
    }

    /// Apache Lounge builds hard-code `Define SRVROOT "c:/Apache24"`; point it at the real root.
    fn post_install(&self, ctx: &FamilyContext<'_>) -> anyhow::Result<()> {
        let root = ctx.app_root();
        ensure_dirs(&root, self.runtime_dirs())?;

        let conf = root.join("conf").join("httpd.conf");
        let minimal = format!(
            "Define SRVROOT \"{}\"\nServerRoot \"${{SRVROOT}}\"\nListen {}\n",
            template_path(&root),
            ctx.setting_or("apache.port", "80")
        );
        if write_if_missing(&conf, &minimal)? {
            return Ok(());
        }

        let content = std::fs::read_to_string(&conf)?;
        let re = Regex::new(r#"(?m)^Define SRVROOT ".*"$"#)?;
        let replacement = format!("Define SRVROOT \"{}\"", template_path(&root));
        let updated = re.replace_all(&content, regex::NoExpand(&replacement));
        if updated != content {
            std::fs::write(&conf, updated.as_ref())?;
        }
        Ok(())
    }

    fn runtime_dirs(&self) -> &'static [&'static str] {
        &["logs", "conf/vhosts"]
    }

    fn is_reverse_proxy(&self) -> bool {
        true
    }
}

//! Hosts-file editing for virtual-host domains.
//!
//! Only uninstalling a reverse proxy touches the hosts file here; adding
//! entries belongs to the site tooling that creates virtual hosts.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::{OrchestratorError, Result};

#[async_trait]
pub trait HostsEditor: Send + Sync {
    /// Remove every mapping for `domains`. Unknown domains are ignored.
    async fn remove_domains(&self, domains: &[String]) -> Result<()>;
}

/// Used when no hosts file is configured.
pub struct NoopHosts;

#[async_trait]
impl HostsEditor for NoopHosts {
    async fn remove_domains(&self, domains: &[String]) -> Result<()> {
        tracing::debug!("No hosts file configured, skipping removal of {:?}", domains);
        Ok(())
    }
}

pub struct FileHostsEditor {
    path: PathBuf,
}

impl FileHostsEditor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Drop `domains` from every mapping line; a line left without hostnames
/// disappears. Comments and blank lines pass through untouched.
pub fn strip_domains(contents: &str, domains: &[String]) -> String {
    let mut out = String::with_capacity(contents.len());
    for line in contents.lines() {
        let (body, comment) = match line.find('#') {
            Some(i) => (&line[..i], Some(&line[i..])),
            None => (line, None),
        };
        let mut fields = body.split_whitespace();
        let Some(address) = fields.next() else {
            out.push_str(line);
            out.push('\n');
            continue;
        };
        let names: Vec<&str> = fields.collect();
        let kept: Vec<&str> = names
            .iter()
            .copied()
            .filter(|n| !domains.iter().any(|d| d.eq_ignore_ascii_case(n)))
            .collect();

        if kept.len() == names.len() {
            out.push_str(line);
        } else if kept.is_empty() {
            continue;
        } else {
            out.push_str(address);
            for name in kept {
                out.push(' ');
                out.push_str(name);
            }
            if let Some(c) = comment {
                out.push(' ');
                out.push_str(c);
            }
        }
        out.push('\n');
    }
    out
}

#[async_trait]
impl HostsEditor for FileHostsEditor {
    async fn remove_domains(&self, domains: &[String]) -> Result<()> {
        if domains.is_empty() {
            return Ok(());
        }
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(OrchestratorError::fs("read", &self.path, e)),
        };
        let updated = strip_domains(&contents, domains);
        if updated != contents {
            tokio::fs::write(&self.path, updated)
                .await
                .map_err(|e| OrchestratorError::fs("write", &self.path, e))?;
            tracing::info!("Removed {:?} from {}", domains, self.path.display());
        }
        Ok(())
    }
}

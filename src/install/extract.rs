//! Extraction Worker
//!
//! 외부 압축 해제 도구(7z)를 우선 사용하고, 없거나 실패하면 zip / tar.gz 라이브러리로
//! 직접 푼다. 두 경로 모두 같은 이벤트 프로토콜(start → progress* → complete)을 보낸다.

use async_trait::async_trait;
use regex::Regex;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractEvent {
    Start { total: u64 },
    Progress { extracted: u64, total: u64 },
    /// One entry failed; extraction carries on.
    Warning { entry: String, message: String },
    Complete,
}

pub type ExtractEvents = mpsc::UnboundedSender<ExtractEvent>;

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        events: ExtractEvents,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Default extractor: external archiver first, in-process fallback second.
pub struct ArchiveExtractor {
    archiver: Option<String>,
}

impl ArchiveExtractor {
    pub fn new(archiver: Option<&str>) -> Self {
        Self {
            archiver: archiver.map(String::from),
        }
    }

    /// In-process only.
    pub fn builtin() -> Self {
        Self { archiver: None }
    }
}

#[async_trait]
impl Extractor for ArchiveExtractor {
    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        events: ExtractEvents,
        cancel: CancellationToken,
    ) -> Result<()> {
        std::fs::create_dir_all(dest).map_err(|e| OrchestratorError::fs("create", dest, e))?;

        if let Some(archiver) = &self.archiver {
            match extract_external(archiver, archive, dest, &events, &cancel).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!("External archiver '{}' failed ({}), falling back to built-in extraction", archiver, e);
                }
            }
        }

        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        // CPU 작업은 블로킹 스레드에서
        tokio::task::spawn_blocking(move || extract_in_process(&archive, &dest, &events, &cancel))
            .await
            .map_err(|e| OrchestratorError::Archive(format!("extraction task failed: {}", e)))?
    }
}

// ─── External archiver ───────────────────────────────────────

fn percent_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,3})%").ok()).as_ref()
}

/// Highest percentage printed in a chunk of `-bsp1` output.
fn parse_percent(chunk: &str) -> Option<u64> {
    percent_regex()?
        .captures_iter(chunk)
        .filter_map(|c| c[1].parse::<u64>().ok())
        .filter(|p| *p <= 100)
        .max()
}

async fn extract_external(
    archiver: &str,
    archive: &Path,
    dest: &Path,
    events: &ExtractEvents,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut cmd = Command::new(archiver);
    cmd.arg("x")
        .arg("-bsp1")
        .arg("-y")
        .arg(format!("-o{}", dest.display()))
        .arg(archive)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    crate::utils::apply_creation_flags(&mut cmd);

    let mut child = cmd
        .spawn()
        .map_err(|e| OrchestratorError::Archive(format!("cannot run '{}': {}", archiver, e)))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| OrchestratorError::Archive("archiver stdout unavailable".into()))?;

    let _ = events.send(ExtractEvent::Start { total: 100 });
    let mut last = 0u64;
    let mut buf = [0u8; 1024];

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(OrchestratorError::Cancelled(archive.display().to_string()));
            }
            read = stdout.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                // 7z는 진행률을 \b / \r 로 덮어쓰므로 줄 단위가 아니라 청크 단위로 파싱
                if let Some(pct) = parse_percent(&String::from_utf8_lossy(&buf[..n])) {
                    if pct > last {
                        last = pct;
                        let _ = events.send(ExtractEvent::Progress { extracted: pct, total: 100 });
                    }
                }
            }
        }
    }

    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(OrchestratorError::Cancelled(archive.display().to_string()));
        }
        status = child.wait() => status?,
    };
    if !status.success() {
        return Err(OrchestratorError::Archive(format!("'{}' exited with {}", archiver, status)));
    }
    if last < 100 {
        let _ = events.send(ExtractEvent::Progress { extracted: 100, total: 100 });
    }
    let _ = events.send(ExtractEvent::Complete);
    Ok(())
}

// ─── In-process fallback ─────────────────────────────────────

enum ArchiveKind {
    Zip,
    TarGz,
}

fn detect_kind(archive: &Path) -> ArchiveKind {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        ArchiveKind::TarGz
    } else {
        ArchiveKind::Zip
    }
}

/// Report every ~5% of entries.
fn progress_step(total: u64) -> u64 {
    (total / 20).max(1)
}

/// Blocking. Callers run it on a `spawn_blocking` thread.
pub fn extract_in_process(
    archive: &Path,
    dest: &Path,
    events: &ExtractEvents,
    cancel: &CancellationToken,
) -> Result<()> {
    std::fs::create_dir_all(dest).map_err(|e| OrchestratorError::fs("create", dest, e))?;
    match detect_kind(archive) {
        ArchiveKind::Zip => extract_zip(archive, dest, events, cancel),
        ArchiveKind::TarGz => extract_tar_gz(archive, dest, events, cancel),
    }
}

fn extract_zip(archive: &Path, dest: &Path, events: &ExtractEvents, cancel: &CancellationToken) -> Result<()> {
    let file = File::open(archive).map_err(|e| OrchestratorError::fs("open", archive, e))?;
    let mut zip = zip::ZipArchive::new(file)?;
    let total = zip.len() as u64;
    let step = progress_step(total);
    let _ = events.send(ExtractEvent::Start { total });

    for i in 0..zip.len() {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled(archive.display().to_string()));
        }
        if let Err((entry, e)) = extract_zip_entry(&mut zip, i, dest) {
            tracing::warn!("Skipping archive entry '{}': {}", entry, e);
            let _ = events.send(ExtractEvent::Warning { entry, message: e.to_string() });
        }
        let extracted = i as u64 + 1;
        if extracted % step == 0 || extracted == total {
            let _ = events.send(ExtractEvent::Progress { extracted, total });
        }
    }

    let _ = events.send(ExtractEvent::Complete);
    Ok(())
}

fn extract_zip_entry(
    zip: &mut zip::ZipArchive<File>,
    index: usize,
    dest: &Path,
) -> std::result::Result<(), (String, io::Error)> {
    let mut entry = zip
        .by_index(index)
        .map_err(|e| (format!("#{}", index), io::Error::new(io::ErrorKind::InvalidData, e)))?;
    let name = entry.name().to_string();
    let rel: PathBuf = match entry.enclosed_name() {
        Some(p) => p.to_path_buf(),
        None => {
            return Err((name, io::Error::new(io::ErrorKind::InvalidInput, "path escapes destination")));
        }
    };
    let out_path = dest.join(rel);

    let result = (|| -> io::Result<()> {
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            return Ok(());
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&out_path)?;
        io::copy(&mut entry, &mut outfile)?;
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    })();
    result.map_err(|e| (name, e))
}

fn extract_tar_gz(archive: &Path, dest: &Path, events: &ExtractEvents, cancel: &CancellationToken) -> Result<()> {
    let open = || -> Result<tar::Archive<flate2::read::GzDecoder<File>>> {
        let file = File::open(archive).map_err(|e| OrchestratorError::fs("open", archive, e))?;
        Ok(tar::Archive::new(flate2::read::GzDecoder::new(file)))
    };

    // tar는 순차 스트림이라 개수를 알려면 한 번 훑어야 함
    let total = open()?
        .entries()
        .map_err(|e| OrchestratorError::Archive(e.to_string()))?
        .count() as u64;
    let step = progress_step(total);
    let _ = events.send(ExtractEvent::Start { total });

    let mut tar = open()?;
    let entries = tar.entries().map_err(|e| OrchestratorError::Archive(e.to_string()))?;
    let mut extracted = 0u64;
    for entry in entries {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled(archive.display().to_string()));
        }
        extracted += 1;
        match entry {
            Ok(mut entry) => {
                let name = entry
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| format!("#{}", extracted));
                // unpack_in은 dest 밖으로 나가는 경로를 거부한다
                match entry.unpack_in(dest) {
                    Ok(true) => {}
                    Ok(false) => {
                        let _ = events.send(ExtractEvent::Warning {
                            entry: name,
                            message: "path escapes destination".into(),
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Skipping archive entry '{}': {}", name, e);
                        let _ = events.send(ExtractEvent::Warning { entry: name, message: e.to_string() });
                    }
                }
            }
            Err(e) => {
                let _ = events.send(ExtractEvent::Warning {
                    entry: format!("#{}", extracted),
                    message: e.to_string(),
                });
            }
        }
        if extracted % step == 0 || extracted == total {
            let _ = events.send(ExtractEvent::Progress { extracted, total });
        }
    }

    let _ = events.send(ExtractEvent::Complete);
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn percent_parsing_takes_max_in_chunk() {
        assert_eq!(parse_percent("  3% 12 - nginx.exe\u{8}\u{8}\u{8}  17%"), Some(17));
        assert_eq!(parse_percent("Everything is Ok"), None);
        assert_eq!(parse_percent("250%"), None);
    }

    #[tokio::test]
    async fn builtin_zip_emits_protocol_and_extracts() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("nginx-1.28.1.zip");
        write_zip(
            &archive,
            &[
                ("nginx-1.28.1/", b""),
                ("nginx-1.28.1/nginx.exe", b"MZ"),
                ("nginx-1.28.1/conf/nginx.conf", b"worker_processes 1;"),
            ],
        );
        let dest = dir.path().join("out");
        let (tx, rx) = mpsc::unbounded_channel();

        ArchiveExtractor::builtin()
            .extract(&archive, &dest, tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(dest.join("nginx-1.28.1/nginx.exe")).unwrap(), b"MZ");
        assert!(dest.join("nginx-1.28.1/conf/nginx.conf").exists());

        let events = collect(rx);
        assert_eq!(events.first(), Some(&ExtractEvent::Start { total: 3 }));
        assert_eq!(events.last(), Some(&ExtractEvent::Complete));
        assert!(events.contains(&ExtractEvent::Progress { extracted: 3, total: 3 }));
    }

    #[tokio::test]
    async fn missing_archiver_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("redis.zip");
        write_zip(&archive, &[("redis-server.exe", b"x")]);
        let dest = dir.path().join("out");
        let (tx, rx) = mpsc::unbounded_channel();

        ArchiveExtractor::new(Some("definitely-not-an-archiver-7z"))
            .extract(&archive, &dest, tx, CancellationToken::new())
            .await
            .unwrap();

        assert!(dest.join("redis-server.exe").exists());
        assert_eq!(collect(rx).last(), Some(&ExtractEvent::Complete));
    }

    #[test]
    fn unsafe_entry_is_a_warning_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../escape.txt", b"x"), ("ok.txt", b"y")]);
        let dest = dir.path().join("out");
        let (tx, rx) = mpsc::unbounded_channel();

        extract_in_process(&archive, &dest, &tx, &CancellationToken::new()).unwrap();
        drop(tx);

        assert!(dest.join("ok.txt").exists());
        assert!(!dir.path().join("escape.txt").exists());
        let events = collect(rx);
        assert!(events.iter().any(|e| matches!(e, ExtractEvent::Warning { entry, .. } if entry == "../escape.txt")));
        assert_eq!(events.last(), Some(&ExtractEvent::Complete));
    }

    #[test]
    fn cancelled_token_stops_before_first_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        write_zip(&archive, &[("a.txt", b"x")]);
        let dest = dir.path().join("out");
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = extract_in_process(&archive, &dest, &tx, &cancel).unwrap_err();
        assert!(err.is_cancelled());
        assert!(!dest.join("a.txt").exists());
    }

    #[test]
    fn tar_gz_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("node-v20.11.0-linux-x64.tar.gz");
        {
            let file = File::create(&archive).unwrap();
            let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(gz);
            let data = b"#!/bin/sh\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, "node-v20.11.0-linux-x64/bin/node", &data[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let dest = dir.path().join("out");
        let (tx, rx) = mpsc::unbounded_channel();

        extract_in_process(&archive, &dest, &tx, &CancellationToken::new()).unwrap();
        drop(tx);

        assert!(dest.join("node-v20.11.0-linux-x64/bin/node").exists());
        let events = collect(rx);
        assert_eq!(events.first(), Some(&ExtractEvent::Start { total: 1 }));
        assert_eq!(events.last(), Some(&ExtractEvent::Complete));
    }
}

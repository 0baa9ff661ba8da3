//! Archive download with cancellation and streamed hashing.

use async_trait::async_trait;
use futures_util::StreamExt;
use sha1::{Digest, Sha1};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{NetworkError, OrchestratorError, Result};

const USER_AGENT: &str = "devstack-core/0.1";

/// Called after every written chunk with `(downloaded, content_length)`.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub bytes: u64,
    /// Lower-case hex SHA-1 of everything written.
    pub sha1: String,
}

#[async_trait]
pub trait ArchiveSource: Send + Sync {
    /// Stream `url` into `dest`. Must return `OrchestratorError::Cancelled` once
    /// `cancel` fires; chunks read after that point are discarded.
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome>;
}

pub struct HttpDownloader {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(1))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client, timeout })
    }

    fn network_error(&self, err: &reqwest::Error) -> OrchestratorError {
        NetworkError::from_reqwest(err, "download", self.timeout.as_secs()).into()
    }
}

#[async_trait]
impl ArchiveSource for HttpDownloader {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled(url.to_string())),
            r = self.client.get(url).send() => r.map_err(|e| self.network_error(&e))?,
        };
        if !response.status().is_success() {
            return Err(NetworkError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            }
            .into());
        }

        let total = response.content_length();
        let mut stream = response.bytes_stream();
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| OrchestratorError::fs("create", dest, e))?;
        let mut hasher = Sha1::new();
        let mut downloaded: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled(url.to_string())),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let data = chunk.map_err(|e| self.network_error(&e))?;
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled(url.to_string()));
            }
            file.write_all(&data).await?;
            hasher.update(&data);
            downloaded += data.len() as u64;
            progress(downloaded, total);
        }
        file.flush().await?;

        tracing::debug!("Downloaded {} bytes from {}", downloaded, url);
        Ok(DownloadOutcome {
            bytes: downloaded,
            sha1: hex::encode(hasher.finalize()),
        })
    }
}

/// Case-insensitive comparison of an expected hex digest.
pub fn digest_matches(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use std::sync::atomic::{AtomicU64, Ordering};

    async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn streams_to_file_and_hashes() {
        let base = serve(axum::Router::new().route("/nginx.zip", get(|| async { vec![7u8; 4096] }))).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nginx.zip");
        let last = AtomicU64::new(0);

        let outcome = HttpDownloader::new(Duration::from_secs(5))
            .unwrap()
            .fetch(
                &format!("{}/nginx.zip", base),
                &dest,
                &|done, _| last.store(done, Ordering::SeqCst),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.bytes, 4096);
        assert_eq!(outcome.sha1, hex::encode(Sha1::digest(vec![7u8; 4096])));
        assert_eq!(last.load(Ordering::SeqCst), 4096);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn non_success_is_status_error() {
        let base = serve(axum::Router::new().route("/gone.zip", get(|| async { StatusCode::NOT_FOUND }))).await;
        let dir = tempfile::tempdir().unwrap();
        let err = HttpDownloader::new(Duration::from_secs(5))
            .unwrap()
            .fetch(&format!("{}/gone.zip", base), &dir.path().join("x"), &|_, _| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Network(NetworkError::Status { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn pre_cancelled_fetch_is_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = HttpDownloader::new(Duration::from_secs(5))
            .unwrap()
            .fetch("http://127.0.0.1:9/never", &dir.path().join("x"), &|_, _| {}, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn digest_comparison_ignores_case() {
        assert!(digest_matches("ABCDEF", "abcdef"));
        assert!(!digest_matches("abc", "abd"));
    }
}

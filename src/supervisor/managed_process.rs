//! Managed Process - direct process spawning with stdio capture
//!
//! Each supervised app gets:
//! - A bounded ring buffer of recent stdout/stderr lines (kept per app id,
//!   independent of whether a process is currently running)
//! - Real-time log broadcast shared by every app
//! - Exit tracking through a watch channel

use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{broadcast, watch, Mutex};

use crate::error::ProcessError;

/// How long the waiter lets stdout/stderr readers finish after the process exits.
const READER_DRAIN: Duration = Duration::from_millis(250);

// ─── Log Types ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// System messages from the supervisor itself
    Info,
    Stdout,
    Stderr,
    Error,
}

/// One captured line, also the payload of the log event stream.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub app_id: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub message: String,
}

// ─── Log Buffer ──────────────────────────────────────────────

/// Ring buffer that keeps the most recent `max_size` lines.
pub struct LogBuffer {
    lines: VecDeque<LogEvent>,
    max_size: usize,
}

impl LogBuffer {
    pub fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            lines: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    /// Push a new line and return the created `LogEvent`.
    pub fn push(&mut self, app_id: &str, kind: LogKind, message: String) -> LogEvent {
        let event = LogEvent {
            app_id: app_id.to_string(),
            timestamp: crate::utils::now_rfc3339(),
            kind,
            message,
        };
        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(event.clone());
        event
    }

    pub fn snapshot(&self) -> Vec<LogEvent> {
        self.lines.iter().cloned().collect()
    }

    /// Get the most recent `count` lines.
    pub fn recent(&self, count: usize) -> Vec<LogEvent> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Writes to one app's buffer and the shared broadcast in one step.
#[derive(Clone)]
pub struct LogSink {
    app_id: Arc<str>,
    buffer: Arc<Mutex<LogBuffer>>,
    tx: broadcast::Sender<LogEvent>,
}

impl LogSink {
    pub fn new(app_id: &str, capacity: usize, tx: broadcast::Sender<LogEvent>) -> Self {
        Self {
            app_id: Arc::from(app_id),
            buffer: Arc::new(Mutex::new(LogBuffer::with_capacity(capacity))),
            tx,
        }
    }

    pub async fn emit(&self, kind: LogKind, message: impl Into<String>) -> LogEvent {
        let event = self.buffer.lock().await.push(&self.app_id, kind, message.into());
        let _ = self.tx.send(event.clone());
        event
    }

    pub async fn snapshot(&self) -> Vec<LogEvent> {
        self.buffer.lock().await.snapshot()
    }

    pub async fn recent_messages(&self, count: usize) -> Vec<String> {
        self.buffer
            .lock()
            .await
            .recent(count)
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    pub async fn clear(&self) {
        self.buffer.lock().await.clear();
    }
}

// ─── Managed Process ─────────────────────────────────────────

/// Called once by the waiter task with the pid after the process exits.
pub type ExitHook = Box<dyn FnOnce(u32) + Send + 'static>;

/// A service process spawned and tracked by the supervisor.
pub struct ManagedProcess {
    pub app_id: String,
    pub pid: u32,
    pub exec_path: PathBuf,
    pub started_at: String,
    /// `None` while running, the exit description afterwards.
    exit_rx: watch::Receiver<Option<String>>,
}

impl ManagedProcess {
    /// Spawn `program` with piped stdout/stderr captured into `sink`.
    ///
    /// On unix the child leads its own process group so a stop can signal
    /// every worker it forks.
    pub async fn spawn(
        app_id: &str,
        program: &Path,
        args: &[String],
        working_dir: &Path,
        sink: LogSink,
        on_exit: ExitHook,
    ) -> Result<Self, ProcessError> {
        let mut cmd = TokioCommand::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        // Windows: hide console window
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            app_id: app_id.to_string(),
            message: format!("{}: {}", program.display(), e),
        })?;
        let pid = child.id().ok_or_else(|| ProcessError::SpawnFailed {
            app_id: app_id.to_string(),
            message: "process exited before its pid could be read".to_string(),
        })?;

        let (exit_tx, exit_rx) = watch::channel(None);

        // ── stdout reader ────────────────────────────────────
        let stdout_task = child.stdout.take().map(|stdout| {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(LogKind::Stdout, line).await;
                }
            })
        });

        // ── stderr reader ────────────────────────────────────
        let stderr_task = child.stderr.take().map(|stderr| {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(LogKind::Stderr, line).await;
                }
            })
        });

        sink.emit(LogKind::Info, format!("Process started with PID {}", pid)).await;

        // ── process waiter ───────────────────────────────────
        {
            let sink = sink.clone();
            let app_id = app_id.to_string();
            tokio::spawn(async move {
                let (kind, desc) = match child.wait().await {
                    Ok(status) if status.success() => (LogKind::Info, status.to_string()),
                    Ok(status) => (LogKind::Error, status.to_string()),
                    Err(e) => (LogKind::Error, format!("wait failed: {}", e)),
                };
                // 종료는 바로 알린다. 파이프를 물려받은 자식이 살아 있으면 EOF가 오지 않음
                let _ = exit_tx.send(Some(desc.clone()));
                tracing::info!("'{}' (pid {}) exited: {}", app_id, pid, desc);

                let readers = async {
                    for task in [stdout_task, stderr_task].into_iter().flatten() {
                        let _ = task.await;
                    }
                };
                if tokio::time::timeout(READER_DRAIN, readers).await.is_err() {
                    tracing::debug!("'{}' output still open after exit, leaving readers attached", app_id);
                }
                sink.emit(kind, format!("Process exited with {}", desc)).await;
                on_exit(pid);
            });
        }

        Ok(Self {
            app_id: app_id.to_string(),
            pid,
            exec_path: program.to_path_buf(),
            started_at: crate::utils::now_rfc3339(),
            exit_rx,
        })
    }

    /// Whether the waiter has not yet observed an exit.
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_status(&self) -> Option<String> {
        self.exit_rx.borrow().clone()
    }

    /// Wait up to `timeout` for exit. Returns whether the process is gone.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.exit_rx.clone();
        let wait = async {
            while rx.borrow_and_update().is_none() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest() {
        let mut buf = LogBuffer::with_capacity(3);
        for i in 0..5 {
            buf.push("redis", LogKind::Stdout, format!("line {}", i));
        }
        let lines: Vec<_> = buf.snapshot().into_iter().map(|e| e.message).collect();
        assert_eq!(lines, vec!["line 2", "line 3", "line 4"]);
        let recent: Vec<_> = buf.recent(2).into_iter().map(|e| e.message).collect();
        assert_eq!(recent, vec!["line 3", "line 4"]);
        assert_eq!(buf.recent(10).len(), 3);
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn log_event_json_shape() {
        let mut buf = LogBuffer::with_capacity(10);
        let ev = buf.push("mysql", LogKind::Stderr, "ready for connections".into());
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["appId"], "mysql");
        assert_eq!(json["type"], "stderr");
        assert_eq!(json["message"], "ready for connections");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn sink_broadcasts_and_buffers() {
        let (tx, mut rx) = broadcast::channel(8);
        let sink = LogSink::new("php", 10, tx);
        sink.emit(LogKind::Info, "hello").await;
        assert_eq!(rx.recv().await.unwrap().message, "hello");
        assert_eq!(sink.recent_messages(5).await, vec!["hello"]);
        sink.clear().await;
        assert!(sink.snapshot().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_output_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _) = broadcast::channel(64);
        let sink = LogSink::new("echo", 50, tx);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let proc = ManagedProcess::spawn(
            "echo",
            Path::new("/bin/sh"),
            &["-c".to_string(), "echo out; echo err >&2; exit 2".to_string()],
            dir.path(),
            sink.clone(),
            Box::new(move |pid| {
                let _ = done_tx.send(pid);
            }),
        )
        .await
        .unwrap();

        assert_eq!(done_rx.await.unwrap(), proc.pid);
        assert!(proc.wait_for_exit(Duration::from_secs(1)).await);
        assert!(!proc.is_running());
        assert!(proc.exit_status().unwrap().contains('2'));

        let logs = sink.snapshot().await;
        assert!(logs.iter().any(|e| e.kind == LogKind::Stdout && e.message == "out"));
        assert!(logs.iter().any(|e| e.kind == LogKind::Stderr && e.message == "err"));
        assert_eq!(logs.last().unwrap().kind, LogKind::Error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_is_reported_while_a_child_holds_the_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _) = broadcast::channel(64);
        let sink = LogSink::new("holder", 50, tx);

        let proc = ManagedProcess::spawn(
            "holder",
            Path::new("/bin/sh"),
            &["-c".to_string(), "echo 'fatal: bad config' >&2; sleep 5 & exit 1".to_string()],
            dir.path(),
            sink.clone(),
            Box::new(|_| {}),
        )
        .await
        .unwrap();

        assert!(proc.wait_for_exit(Duration::from_secs(2)).await);
        assert!(!proc.is_running());
        let mut seen = false;
        for _ in 0..50 {
            if sink.recent_messages(5).await.iter().any(|m| m == "fatal: bad config") {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen);
        crate::process_monitor::kill_leftover_group(proc.pid);
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _) = broadcast::channel(4);
        let err = ManagedProcess::spawn(
            "ghost",
            &dir.path().join("no-such-binary"),
            &[],
            dir.path(),
            LogSink::new("ghost", 10, tx),
            Box::new(|_| {}),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ProcessError::SpawnFailed { .. }));
    }
}

//! Install progress events and their throttling.
//!
//! Global progress ranges: download 0–50, extraction 50–90, the rest 90–100.
//! Events are rate-limited to one per second per install, except on a phase
//! change or when progress reaches 100.

use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const THROTTLE: Duration = Duration::from_secs(1);

/// Used when the server sends no Content-Length.
pub const UNKNOWN_SIZE_PROGRESS: u8 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPhase {
    Idle,
    GroupCheck,
    Downloading,
    Extracting,
    Locating,
    Configuring,
    Persisting,
    Done,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub app_id: String,
    pub progress: u8,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_detail: Option<String>,
}

/// `round(downloaded / total * 50)`, or the fixed heuristic when the size is unknown.
pub fn download_progress(downloaded: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => {
            let pct = (downloaded as f64 / total as f64 * 50.0).round();
            pct.clamp(0.0, 50.0) as u8
        }
        _ => UNKNOWN_SIZE_PROGRESS,
    }
}

/// Map extraction progress into 50–90.
pub fn extract_progress(extracted: u64, total: u64) -> u8 {
    if total == 0 {
        return 50;
    }
    let ratio = (extracted as f64 / total as f64).clamp(0.0, 1.0);
    50 + (ratio * 40.0).round() as u8
}

struct ThrottleState {
    phase: InstallPhase,
    progress: u8,
    last_emit: Option<Instant>,
}

pub struct ProgressReporter {
    app_id: String,
    tx: broadcast::Sender<ProgressEvent>,
    interval: Duration,
    state: Mutex<ThrottleState>,
}

impl ProgressReporter {
    pub fn new(app_id: &str, tx: broadcast::Sender<ProgressEvent>) -> Self {
        Self::with_interval(app_id, tx, THROTTLE)
    }

    pub fn with_interval(app_id: &str, tx: broadcast::Sender<ProgressEvent>, interval: Duration) -> Self {
        Self {
            app_id: app_id.to_string(),
            tx,
            interval,
            state: Mutex::new(ThrottleState {
                phase: InstallPhase::Idle,
                progress: 0,
                last_emit: None,
            }),
        }
    }

    /// Returns whether an event was sent.
    pub fn report(&self, phase: InstallPhase, progress: u8, status: &str) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let phase_changed = state.phase != phase;
        // 같은 단계 안에서는 감소하지 않음
        let progress = if phase_changed { progress } else { progress.max(state.progress) };
        let due = state
            .last_emit
            .map(|t| t.elapsed() >= self.interval)
            .unwrap_or(true);

        state.phase = phase;
        state.progress = progress;
        if !(phase_changed || progress >= 100 || due) {
            return false;
        }
        state.last_emit = Some(Instant::now());
        drop(state);

        let _ = self.tx.send(ProgressEvent {
            app_id: self.app_id.clone(),
            progress: progress.min(100),
            status: status.to_string(),
            log_detail: None,
        });
        true
    }

    /// Warnings and other detail lines bypass the throttle.
    pub fn detail(&self, status: &str, detail: String) {
        let progress = self.state.lock().map(|s| s.progress).unwrap_or(0);
        let _ = self.tx.send(ProgressEvent {
            app_id: self.app_id.clone(),
            progress,
            status: status.to_string(),
            log_detail: Some(detail),
        });
    }

    pub fn phase(&self) -> InstallPhase {
        self.state.lock().map(|s| s.phase).unwrap_or(InstallPhase::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_mapping() {
        assert_eq!(download_progress(0, Some(100)), 0);
        assert_eq!(download_progress(50, Some(100)), 25);
        assert_eq!(download_progress(100, Some(100)), 50);
        assert_eq!(download_progress(1, Some(3)), 17);
        assert_eq!(download_progress(10, None), UNKNOWN_SIZE_PROGRESS);
        assert_eq!(download_progress(10, Some(0)), UNKNOWN_SIZE_PROGRESS);
    }

    #[test]
    fn extract_mapping_starts_at_fifty() {
        assert_eq!(extract_progress(0, 10), 50);
        assert_eq!(extract_progress(5, 10), 70);
        assert_eq!(extract_progress(10, 10), 90);
        assert_eq!(extract_progress(0, 0), 50);
    }

    #[test]
    fn throttles_within_phase_but_not_on_transition_or_completion() {
        let (tx, mut rx) = broadcast::channel(16);
        let reporter = ProgressReporter::new("nginx", tx);

        assert!(reporter.report(InstallPhase::Downloading, 1, "Downloading"));
        assert!(!reporter.report(InstallPhase::Downloading, 10, "Downloading"));
        assert!(!reporter.report(InstallPhase::Downloading, 20, "Downloading"));
        assert!(reporter.report(InstallPhase::Extracting, 50, "Extracting"));
        assert!(reporter.report(InstallPhase::Done, 100, "Installed"));

        let got: Vec<u8> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.progress).collect();
        assert_eq!(got, vec![1, 50, 100]);
    }

    #[test]
    fn progress_never_decreases_within_phase() {
        let (tx, mut rx) = broadcast::channel(16);
        let reporter = ProgressReporter::with_interval("redis", tx, Duration::ZERO);
        reporter.report(InstallPhase::Downloading, 30, "Downloading");
        reporter.report(InstallPhase::Downloading, 20, "Downloading");
        let got: Vec<u8> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.progress).collect();
        assert_eq!(got, vec![30, 30]);
    }

    #[test]
    fn event_serializes_camel_case() {
        let ev = ProgressEvent {
            app_id: "php".into(),
            progress: 42,
            status: "Extracting".into(),
            log_detail: Some("skipped".into()),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["appId"], "php");
        assert_eq!(json["logDetail"], "skipped");
    }
}

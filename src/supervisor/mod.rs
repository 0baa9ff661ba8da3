//! Service Supervisor: 설치된 앱 프로세스의 시작/중지/상태/로그
//!
//! 프로세스 맵, 앱별 로그 버퍼, 앱별 직렬화 락은 모두 `Supervisor` 값이 소유합니다.
//! 같은 앱에 대한 start/stop/restart는 앱별 락으로 순서가 보장되고,
//! 서로 다른 앱은 병렬로 처리됩니다.

pub mod managed_process;

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::Command as TokioCommand;
use tokio::sync::broadcast;

use crate::config::GlobalConfig;
use crate::error::{OrchestratorError, ProcessError, Result};
use crate::family::{AppFamily, FamilyContext, FamilyTable};
use crate::process_monitor;
use crate::registry::InstallRegistry;
use managed_process::{LogEvent, LogKind, LogSink, ManagedProcess};

/// Lines attached to an `ExitedEarly` error.
const EARLY_EXIT_LOG_LINES: usize = 5;
/// Extra wait after a forced kill before giving up on the waiter.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub log_buffer_lines: usize,
    /// How long a fresh process must survive before start reports success.
    pub start_grace: Duration,
    /// Bound on a vendor stop command and on the graceful-kill wait.
    pub stop_timeout: Duration,
    pub auto_start_stagger: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&GlobalConfig::default())
    }
}

impl From<&GlobalConfig> for SupervisorConfig {
    fn from(cfg: &GlobalConfig) -> Self {
        Self {
            log_buffer_lines: cfg.log_buffer_lines,
            start_grace: cfg.timeouts.start_grace(),
            stop_timeout: cfg.timeouts.stop_command(),
            auto_start_stagger: cfg.timeouts.auto_start_stagger(),
        }
    }
}

/// Snapshot of one tracked process.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrackedProcess {
    pub app_id: String,
    pub pid: u32,
    pub exec_path: String,
    pub started_at: String,
}

/// Outcome of [`Supervisor::recover_auto_start`].
#[derive(Debug, Default, Clone, Serialize)]
pub struct AutoStartReport {
    pub started: Vec<String>,
    /// `(app_id, error message)`
    pub failed: Vec<(String, String)>,
}

type ProcessMap = Arc<Mutex<HashMap<String, Arc<ManagedProcess>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Supervisor {
    registry: Arc<InstallRegistry>,
    families: Arc<FamilyTable>,
    config: SupervisorConfig,
    processes: ProcessMap,
    logs: Mutex<HashMap<String, LogSink>>,
    log_tx: broadcast::Sender<LogEvent>,
    app_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Supervisor {
    pub fn new(registry: Arc<InstallRegistry>, families: Arc<FamilyTable>, config: SupervisorConfig) -> Self {
        let (log_tx, _) = broadcast::channel(1024);
        Self {
            registry,
            families,
            config,
            processes: Arc::new(Mutex::new(HashMap::new())),
            logs: Mutex::new(HashMap::new()),
            log_tx,
            app_locks: Mutex::new(HashMap::new()),
        }
    }

    fn app_lock(&self, app_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.app_locks)
            .entry(app_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn sink(&self, app_id: &str) -> LogSink {
        lock(&self.logs)
            .entry(app_id.to_string())
            .or_insert_with(|| LogSink::new(app_id, self.config.log_buffer_lines, self.log_tx.clone()))
            .clone()
    }

    fn context<'a>(&'a self, app_id: &'a str, install_dir: &'a Path, exec_path: &'a Path) -> FamilyContext<'a> {
        FamilyContext {
            app_id,
            install_dir,
            exec_path,
            registry: &self.registry,
        }
    }

    /// Install directory recorded for `app_id`, else the executable's directory.
    fn install_dir_for(&self, app_id: &str, exec_path: &Path) -> PathBuf {
        match self.registry.get(app_id) {
            Ok(Some(row)) => PathBuf::from(row.install_path),
            _ => exec_path.parent().unwrap_or(Path::new(".")).to_path_buf(),
        }
    }

    /// Stored custom arguments, else the family's default arguments, else none.
    pub fn resolve_start_args(&self, app_id: &str, exec_path: &Path) -> String {
        if let Ok(Some(row)) = self.registry.get(app_id) {
            if let Some(args) = row.custom_args.filter(|a| !a.trim().is_empty()) {
                return args;
            }
        }
        let install_dir = self.install_dir_for(app_id, exec_path);
        let ctx = self.context(app_id, &install_dir, exec_path);
        self.families
            .lookup(app_id)
            .default_start_args(&ctx)
            .unwrap_or_default()
    }

    // ─── Start ───────────────────────────────────────────────

    /// Start `exec_path` for `app_id` and return its pid once it survived the grace period.
    pub async fn start(&self, app_id: &str, exec_path: &Path, args: &str) -> Result<u32> {
        let app_lock = self.app_lock(app_id);
        let _guard = app_lock.lock().await;
        self.start_locked(app_id, exec_path, args).await
    }

    async fn start_locked(&self, app_id: &str, exec_path: &Path, args: &str) -> Result<u32> {
        let existing = lock(&self.processes).get(app_id).cloned();
        if let Some(proc) = existing {
            if proc.is_running() && process_monitor::is_pid_alive(proc.pid) {
                return Err(ProcessError::AlreadyRunning {
                    app_id: app_id.to_string(),
                    pid: proc.pid,
                }
                .into());
            }
            tracing::debug!("Discarding stale entry for '{}' (pid {})", app_id, proc.pid);
            self.untrack(app_id, proc.pid);
        }

        if !exec_path.is_file() {
            return Err(ProcessError::SpawnFailed {
                app_id: app_id.to_string(),
                message: format!("executable not found: {}", exec_path.display()),
            }
            .into());
        }

        let sink = self.sink(app_id);
        let family = self.families.lookup(app_id);
        let install_dir = self.install_dir_for(app_id, exec_path);
        let ctx = self.context(app_id, &install_dir, exec_path);

        crate::family::ensure_dirs(&ctx.app_root(), family.runtime_dirs())
            .map_err(|e| OrchestratorError::Filesystem(format!("{:#}", e)))?;
        self.initialize_data_dir(family.as_ref(), &ctx, &sink).await?;

        let argv = crate::utils::split_args(args);
        let working_dir = exec_path.parent().unwrap_or(install_dir.as_path());
        tracing::info!("Starting '{}': {} {:?}", app_id, exec_path.display(), argv);

        let on_exit = {
            let processes = Arc::clone(&self.processes);
            let app_id = app_id.to_string();
            Box::new(move |pid: u32| {
                let mut map = lock(&processes);
                if map.get(&app_id).map(|p| p.pid) == Some(pid) {
                    map.remove(&app_id);
                }
            })
        };
        let proc = Arc::new(ManagedProcess::spawn(app_id, exec_path, &argv, working_dir, sink.clone(), on_exit).await?);
        let pid = proc.pid;
        lock(&self.processes).insert(app_id.to_string(), Arc::clone(&proc));

        tokio::time::sleep(self.config.start_grace).await;
        if !proc.is_running() {
            self.untrack(app_id, pid);
            // 리더가 죽어도 백그라운드로 띄운 자식은 그룹에 남아 있을 수 있음
            process_monitor::kill_leftover_group(pid);
            let status = proc.exit_status().unwrap_or_else(|| "unknown status".to_string());
            let recent_logs = sink.recent_messages(EARLY_EXIT_LOG_LINES).await;
            tracing::warn!("'{}' exited during startup ({})", app_id, status);
            return Err(ProcessError::ExitedEarly {
                app_id: app_id.to_string(),
                status,
                recent_logs,
            }
            .into());
        }

        tracing::info!("'{}' running with PID {}", app_id, pid);
        Ok(pid)
    }

    /// Run the family's one-time initializer when its data directory is missing.
    async fn initialize_data_dir(
        &self,
        family: &dyn AppFamily,
        ctx: &FamilyContext<'_>,
        sink: &LogSink,
    ) -> Result<()> {
        let Some(data_dir) = family.data_dir(ctx) else {
            return Ok(());
        };
        if data_dir.exists() {
            return Ok(());
        }
        let init_failed = |message: String| ProcessError::InitFailed {
            app_id: ctx.app_id.to_string(),
            message,
        };

        if let Some(plan) = family.init_plan(ctx) {
            sink.emit(LogKind::Info, format!("Initializing data directory {}", data_dir.display()))
                .await;
            if let Some((path, contents)) = &plan.config {
                crate::family::write_if_missing(path, contents).map_err(|e| init_failed(format!("{:#}", e)))?;
            }
            if let Some(program) = &plan.program {
                let mut cmd = TokioCommand::new(program);
                cmd.args(&plan.args)
                    .current_dir(ctx.app_root())
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
                crate::utils::apply_creation_flags(&mut cmd);
                let output = cmd
                    .output()
                    .await
                    .map_err(|e| init_failed(format!("{}: {}", program.display(), e)))?;

                for (kind, bytes) in [(LogKind::Stdout, &output.stdout), (LogKind::Stderr, &output.stderr)] {
                    for line in String::from_utf8_lossy(bytes).lines() {
                        sink.emit(kind, line).await;
                    }
                }
                if !output.status.success() {
                    // 절반만 만들어진 데이터 디렉토리는 다음 시작 때 초기화를 막음
                    crate::install::remove_dir_best_effort(&data_dir);
                    return Err(init_failed(format!("{} exited with {}", program.display(), output.status)).into());
                }
            }
        }

        if !data_dir.exists() {
            std::fs::create_dir_all(&data_dir).map_err(|e| OrchestratorError::fs("create", &data_dir, e))?;
        }
        tracing::info!("Initialized data directory for '{}'", ctx.app_id);
        Ok(())
    }

    // ─── Stop ────────────────────────────────────────────────

    /// Explicit stop: also clears the row's auto-start flag, even on failure.
    pub async fn stop(&self, app_id: &str, exec_path: &Path, stop_args: Option<&str>) -> Result<()> {
        let app_lock = self.app_lock(app_id);
        let _guard = app_lock.lock().await;
        let result = self.stop_locked(app_id, exec_path, stop_args).await;
        if let Err(e) = self.registry.set_auto_start(app_id, false) {
            tracing::warn!("Could not clear auto_start for '{}': {}", app_id, e);
        }
        result
    }

    async fn stop_locked(&self, app_id: &str, exec_path: &Path, stop_args: Option<&str>) -> Result<()> {
        let tracked = lock(&self.processes).remove(app_id);
        let sink = self.sink(app_id);
        tracing::info!("Stopping '{}'", app_id);

        let mut result = Ok(());
        match stop_args.filter(|a| !a.trim().is_empty()) {
            Some(args) => {
                self.run_stop_command(app_id, exec_path, args).await;
                if let Some(proc) = &tracked {
                    if !proc.wait_for_exit(self.config.stop_timeout).await {
                        result = self.force_kill(app_id, proc).await;
                    }
                }
            }
            None => {
                if let Some(proc) = &tracked {
                    result = self.terminate(app_id, proc).await;
                }
            }
        }

        // 이전 세션에서 남은 같은 이름의 프로세스까지 정리
        let swept = process_monitor::kill_by_executable_async(exec_path).await;
        if swept > 0 {
            tracing::info!("Swept {} orphaned '{}' process(es)", swept, app_id);
        }
        sink.emit(LogKind::Info, "Stop requested").await;
        result
    }

    /// Run `<exec> <stop_args>` and wait a bounded time; a timeout counts as stopped.
    async fn run_stop_command(&self, app_id: &str, exec_path: &Path, stop_args: &str) {
        let mut cmd = TokioCommand::new(exec_path);
        cmd.args(crate::utils::split_args(stop_args))
            .current_dir(exec_path.parent().unwrap_or(Path::new(".")))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Stop command for '{}' failed to spawn: {}", app_id, e);
                return;
            }
        };
        match tokio::time::timeout(self.config.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!("Stop command for '{}' exited with {}", app_id, status),
            Ok(Err(e)) => tracing::warn!("Stop command for '{}' failed: {}", app_id, e),
            Err(_) => tracing::warn!(
                "Stop command for '{}' did not finish within {:?}, assuming stopped",
                app_id,
                self.config.stop_timeout
            ),
        }
    }

    /// Graceful group signal, escalating to a forced kill after the stop timeout.
    async fn terminate(&self, app_id: &str, proc: &ManagedProcess) -> Result<()> {
        if !proc.is_running() {
            return Ok(());
        }
        if let Err(message) = process_monitor::kill_tree(proc.pid, false) {
            tracing::warn!("{}", message);
        }
        if proc.wait_for_exit(self.config.stop_timeout).await {
            return Ok(());
        }
        self.force_kill(app_id, proc).await
    }

    async fn force_kill(&self, app_id: &str, proc: &ManagedProcess) -> Result<()> {
        tracing::warn!("'{}' (pid {}) did not exit, killing", app_id, proc.pid);
        process_monitor::kill_tree(proc.pid, true).map_err(|message| ProcessError::KillFailed {
            app_id: app_id.to_string(),
            message,
        })?;
        if proc.wait_for_exit(FORCE_KILL_WAIT).await {
            Ok(())
        } else {
            Err(ProcessError::KillFailed {
                app_id: app_id.to_string(),
                message: format!("pid {} survived SIGKILL", proc.pid),
            }
            .into())
        }
    }

    fn untrack(&self, app_id: &str, pid: u32) {
        let mut map = lock(&self.processes);
        if map.get(app_id).map(|p| p.pid) == Some(pid) {
            map.remove(app_id);
        }
    }

    // ─── Restart / Status ────────────────────────────────────

    /// Stop then start. Missing `start_args` fall back to the stored custom args.
    /// Unlike [`Supervisor::stop`], the auto-start flag is left alone.
    pub async fn restart(
        &self,
        app_id: &str,
        exec_path: &Path,
        start_args: Option<&str>,
        stop_args: Option<&str>,
    ) -> Result<u32> {
        let app_lock = self.app_lock(app_id);
        let _guard = app_lock.lock().await;
        self.stop_locked(app_id, exec_path, stop_args).await?;
        let args = match start_args {
            Some(a) => a.to_string(),
            None => self.resolve_start_args(app_id, exec_path),
        };
        self.start_locked(app_id, exec_path, &args).await
    }

    /// Name-based check against the OS process table. It also reports
    /// same-named instances this supervisor did not start.
    pub async fn status(&self, app_id: &str, exec_path: &Path) -> bool {
        let running = process_monitor::is_executable_running_async(exec_path).await;
        tracing::trace!("status '{}' -> {}", app_id, running);
        running
    }

    // ─── Auto-start recovery ─────────────────────────────────

    /// Start every `auto_start` row in turn. One failure never stops the rest.
    pub async fn recover_auto_start(&self) -> Result<AutoStartReport> {
        let rows = self.registry.auto_start_apps()?;
        let mut report = AutoStartReport::default();
        tracing::info!("Auto-start: {} app(s) flagged", rows.len());

        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.auto_start_stagger).await;
            }
            let exec_path = PathBuf::from(&row.exec_path);
            let args = self.resolve_start_args(&row.app_id, &exec_path);
            match self.start(&row.app_id, &exec_path, &args).await {
                Ok(pid) => {
                    tracing::info!("Auto-started '{}' (pid {})", row.app_id, pid);
                    report.started.push(row.app_id.clone());
                }
                Err(e) => {
                    tracing::error!("Auto-start of '{}' failed: {}", row.app_id, e);
                    report.failed.push((row.app_id.clone(), e.to_string()));
                }
            }
        }
        Ok(report)
    }

    // ─── Logs ────────────────────────────────────────────────

    pub async fn logs(&self, app_id: &str) -> Vec<LogEvent> {
        let sink = lock(&self.logs).get(app_id).cloned();
        match sink {
            Some(sink) => sink.snapshot().await,
            None => Vec::new(),
        }
    }

    pub async fn clear_logs(&self, app_id: &str) {
        let sink = lock(&self.logs).get(app_id).cloned();
        if let Some(sink) = sink {
            sink.clear().await;
        }
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEvent> {
        self.log_tx.subscribe()
    }

    // ─── Tracking ────────────────────────────────────────────

    pub fn running_apps(&self) -> Vec<TrackedProcess> {
        let mut out: Vec<TrackedProcess> = lock(&self.processes)
            .values()
            .map(|p| TrackedProcess {
                app_id: p.app_id.clone(),
                pid: p.pid,
                exec_path: p.exec_path.to_string_lossy().to_string(),
                started_at: p.started_at.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        out
    }

    pub fn tracked_pid(&self, app_id: &str) -> Option<u32> {
        lock(&self.processes).get(app_id).map(|p| p.pid)
    }

    /// Stop every tracked process. Auto-start flags survive for the next boot.
    pub async fn shutdown(&self) {
        let tracked: Vec<(String, PathBuf)> = lock(&self.processes)
            .values()
            .map(|p| (p.app_id.clone(), p.exec_path.clone()))
            .collect();
        tracing::info!("Supervisor shutdown: stopping {} process(es)", tracked.len());

        for (app_id, exec_path) in tracked {
            let stop_args = self.families.lookup(&app_id).stop_args();
            let app_lock = self.app_lock(&app_id);
            let _guard = app_lock.lock().await;
            if let Err(e) = self.stop_locked(&app_id, &exec_path, stop_args).await {
                tracing::warn!("Failed to stop '{}' during shutdown: {}", app_id, e);
            }
        }
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::test_support::{fast_config, script};
    use super::*;
    use crate::family::InitPlan;
    use crate::registry::InstalledApp;

    const SLEEPER: &str = "echo started\nwhile true; do sleep 1; done";

    fn supervisor(families: FamilyTable) -> (Arc<InstallRegistry>, Supervisor) {
        let registry = Arc::new(InstallRegistry::open_in_memory().unwrap());
        let sup = Supervisor::new(Arc::clone(&registry), Arc::new(families), fast_config());
        (registry, sup)
    }

    fn row(app_id: &str, exec: &Path, auto_start: bool) -> InstalledApp {
        let now = crate::utils::now_rfc3339();
        InstalledApp {
            app_id: app_id.to_string(),
            installed_version: "1.0.0".to_string(),
            install_path: exec.parent().unwrap().to_string_lossy().to_string(),
            exec_path: exec.to_string_lossy().to_string(),
            cli_path: None,
            custom_args: None,
            auto_start,
            show_on_dashboard: true,
            installed_at: now.clone(),
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn second_start_is_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(dir.path(), "double", SLEEPER);
        let (_, sup) = supervisor(FamilyTable::empty());

        let pid = sup.start("svc-double", &exec, "").await.unwrap();
        let err = sup.start("svc-double", &exec, "").await.unwrap_err();
        match err {
            OrchestratorError::Process(ProcessError::AlreadyRunning { pid: p, .. }) => assert_eq!(p, pid),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(sup.running_apps().len(), 1);
        assert_eq!(sup.tracked_pid("svc-double"), Some(pid));

        sup.stop("svc-double", &exec, None).await.unwrap();
        assert!(sup.tracked_pid("svc-double").is_none());
        assert!(!process_monitor::is_pid_alive(pid));
    }

    #[tokio::test]
    async fn early_exit_carries_recent_logs() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(dir.path(), "early", "echo 'bind: address already in use' >&2\nexit 1");
        let (_, sup) = supervisor(FamilyTable::empty());

        let err = sup.start("svc-early", &exec, "").await.unwrap_err();
        match &err {
            OrchestratorError::Process(ProcessError::ExitedEarly { recent_logs, .. }) => {
                assert!(recent_logs.iter().any(|l| l.contains("address already in use")));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(err.to_json()["error_code"], "EXITED_EARLY");
        assert!(sup.tracked_pid("svc-early").is_none());

        assert!(!sup.logs("svc-early").await.is_empty());
        sup.clear_logs("svc-early").await;
        assert!(sup.logs("svc-early").await.is_empty());
    }

    #[tokio::test]
    async fn early_exit_detected_while_background_child_holds_output() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(dir.path(), "holder", "echo 'fatal: bad config' >&2\nsleep 5 &\nexit 1");
        let (_, sup) = supervisor(FamilyTable::empty());

        let err = sup.start("svc-holder", &exec, "").await.unwrap_err();
        match &err {
            OrchestratorError::Process(ProcessError::ExitedEarly { recent_logs, .. }) => {
                assert!(recent_logs.iter().any(|l| l == "fatal: bad config"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(sup.tracked_pid("svc-holder").is_none());
        assert!(sup.running_apps().is_empty());
    }

    #[tokio::test]
    async fn status_follows_process_table() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(dir.path(), "status", SLEEPER);
        let (registry, sup) = supervisor(FamilyTable::empty());
        registry.upsert(&row("svc-status", &exec, true)).unwrap();

        sup.start("svc-status", &exec, "").await.unwrap();
        assert!(sup.status("svc-status", &exec).await);

        sup.stop("svc-status", &exec, None).await.unwrap();
        assert!(!sup.status("svc-status", &exec).await);
        assert!(!registry.get("svc-status").unwrap().unwrap().auto_start);
    }

    #[tokio::test]
    async fn stop_command_then_forced_kill() {
        let dir = tempfile::tempdir().unwrap();
        // "-s stop" 은 즉시 종료하고, 실행 중인 인스턴스는 신호로만 죽음
        let exec = script(
            dir.path(),
            "stopcmd",
            "if [ \"$1\" = \"-s\" ]; then exit 0; fi\nwhile true; do sleep 1; done",
        );
        let (_, sup) = supervisor(FamilyTable::empty());

        let pid = sup.start("svc-stopcmd", &exec, "").await.unwrap();
        sup.stop("svc-stopcmd", &exec, Some("-s stop")).await.unwrap();
        assert!(sup.tracked_pid("svc-stopcmd").is_none());
        assert!(!process_monitor::is_pid_alive(pid));
    }

    #[tokio::test]
    async fn auto_start_continues_past_failure() {
        let dir = tempfile::tempdir().unwrap();
        let first = script(dir.path(), "auto-a", SLEEPER);
        let third = script(dir.path(), "auto-c", SLEEPER);
        let missing = dir.path().join("missing-binary");
        let (registry, sup) = supervisor(FamilyTable::empty());
        registry.upsert(&row("auto-a", &first, true)).unwrap();
        registry.upsert(&row("auto-b", &missing, true)).unwrap();
        registry.upsert(&row("auto-c", &third, true)).unwrap();
        registry.upsert(&row("auto-off", &third, false)).unwrap();

        let report = sup.recover_auto_start().await.unwrap();
        assert_eq!(report.started, vec!["auto-a", "auto-c"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "auto-b");
        assert!(sup.tracked_pid("auto-a").is_some());
        assert!(sup.tracked_pid("auto-c").is_some());

        sup.shutdown().await;
        assert!(sup.running_apps().is_empty());
        // shutdown keeps the flags for the next boot
        assert!(registry.get("auto-a").unwrap().unwrap().auto_start);
    }

    #[tokio::test]
    async fn restart_reuses_stored_args() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(dir.path(), "restart", "echo \"args: $*\"\nwhile true; do sleep 1; done");
        let (registry, sup) = supervisor(FamilyTable::empty());
        let mut r = row("svc-restart", &exec, true);
        r.custom_args = Some("--port 8080".to_string());
        registry.upsert(&r).unwrap();

        let first = sup.start("svc-restart", &exec, "").await.unwrap();
        let second = sup.restart("svc-restart", &exec, None, None).await.unwrap();
        assert_ne!(first, second);
        let logs = sup.logs("svc-restart").await;
        assert!(logs.iter().any(|e| e.message == "args: --port 8080"));
        assert!(registry.get("svc-restart").unwrap().unwrap().auto_start);

        sup.stop("svc-restart", &exec, None).await.unwrap();
    }

    struct ScriptedInit {
        initializer: PathBuf,
    }

    impl AppFamily for ScriptedInit {
        fn name(&self) -> &'static str {
            "scripted-init"
        }

        fn runtime_dirs(&self) -> &'static [&'static str] {
            &["logs", "tmp"]
        }

        fn data_dir(&self, ctx: &FamilyContext<'_>) -> Option<PathBuf> {
            Some(ctx.app_root().join("data"))
        }

        fn init_plan(&self, ctx: &FamilyContext<'_>) -> Option<InitPlan> {
            let root = ctx.app_root();
            Some(InitPlan {
                program: Some(self.initializer.clone()),
                args: vec![root.join("data").to_string_lossy().to_string()],
                config: Some((root.join("db.cfg"), "port=1234\n".to_string())),
            })
        }
    }

    #[tokio::test]
    async fn missing_data_dir_runs_initializer_once() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(dir.path(), "initdb-svc", SLEEPER);
        let init = script(dir.path(), "initdb-tool", "mkdir -p \"$1\"\necho initialized > \"$1/marker\"");
        let families = FamilyTable::empty().register("initdb", Arc::new(ScriptedInit { initializer: init }));
        let (_, sup) = supervisor(families);

        sup.start("initdb-svc", &exec, "").await.unwrap();
        assert!(dir.path().join("data/marker").is_file());
        assert!(dir.path().join("db.cfg").is_file());
        assert!(dir.path().join("logs").is_dir());
        assert!(dir.path().join("tmp").is_dir());
        sup.stop("initdb-svc", &exec, None).await.unwrap();
    }

    #[tokio::test]
    async fn failed_initializer_leaves_no_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(dir.path(), "initfail-svc", SLEEPER);
        let init = script(dir.path(), "initfail-tool", "mkdir -p \"$1\"\necho 'cannot init' >&2\nexit 3");
        let families = FamilyTable::empty().register("initfail", Arc::new(ScriptedInit { initializer: init }));
        let (_, sup) = supervisor(families);

        let err = sup.start("initfail-svc", &exec, "").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Process(ProcessError::InitFailed { .. })));
        assert!(!dir.path().join("data").exists());
        assert!(sup.tracked_pid("initfail-svc").is_none());
        let logs = sup.logs("initfail-svc").await;
        assert!(logs.iter().any(|e| e.message == "cannot init"));
    }
}

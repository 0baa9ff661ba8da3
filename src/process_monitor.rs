//! OS 프로세스 테이블 조회: 실행 파일 이름 기반 상태 확인과 kill sweep
//!
//! 이름 기반 매칭은 근사치입니다. 같은 이름의 인스턴스가 여럿이면 구분하지 못하며,
//! 이 데몬이 띄운 인스턴스인지도 보장하지 않습니다.

use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::System;

/// Linux `comm` is truncated to 15 bytes.
const COMM_LEN: usize = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningProcess {
    pub pid: u32,
    pub name: String,
    pub executable_path: Option<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
}

/// 크로스 플랫폼: 실행 중인 모든 프로세스 목록 가져오기
pub fn get_running_processes() -> Vec<RunningProcess> {
    let mut sys = System::new_all();
    sys.refresh_all();

    let processes: Vec<RunningProcess> = sys
        .processes()
        .iter()
        .map(|(pid, process)| RunningProcess {
            pid: pid.as_u32(),
            name: process.name().to_string(),
            executable_path: process.exe().and_then(|p| p.to_str()).map(String::from),
            cmd: process.cmd().to_vec(),
        })
        .collect();

    tracing::debug!("Found {} running processes", processes.len());
    processes
}

fn basename_lower(s: &str) -> String {
    s.rsplit(['/', '\\']).next().unwrap_or(s).to_lowercase()
}

fn strip_exe(s: &str) -> &str {
    s.strip_suffix(".exe").unwrap_or(s)
}

/// Whether `process` looks like an instance of the executable `basename` (lower-case).
///
/// Checks the process name (including the truncated `comm` form), the image
/// path, and the first two command-line words so interpreter-launched scripts
/// (`/bin/sh /path/run.sh`) match by script name.
pub fn matches_executable(process: &RunningProcess, basename: &str) -> bool {
    if basename.is_empty() {
        return false;
    }
    let target = basename.to_lowercase();
    let name = process.name.to_lowercase();
    if strip_exe(&name) == strip_exe(&target) {
        return true;
    }
    if name.len() == COMM_LEN && target.starts_with(&name) {
        return true;
    }
    if let Some(exe) = &process.executable_path {
        if basename_lower(exe) == target {
            return true;
        }
    }
    // argv[1]은 인터프리터로 띄운 스크립트일 때만 본다 (`vim nginx.conf` 같은 편집기 제외)
    let mut argv = process.cmd.iter().map(|a| basename_lower(a));
    match argv.next() {
        Some(first) if first == target => true,
        Some(first) if is_interpreter(&first) => argv.next().map(|second| second == target).unwrap_or(false),
        _ => false,
    }
}

/// Shells and script runtimes whose first argument names the real program.
fn is_interpreter(basename: &str) -> bool {
    const INTERPRETERS: &[&str] = &[
        "sh", "bash", "dash", "zsh", "ksh", "busybox", "python", "python3", "node", "php", "perl", "ruby",
    ];
    let stem = strip_exe(basename);
    INTERPRETERS.contains(&stem)
        || stem
            .strip_prefix("python")
            .map(|v| v.chars().all(|c| c.is_ascii_digit() || c == '.'))
            .unwrap_or(false)
}

/// 실행 파일 경로의 basename으로 검색 (자기 자신은 제외)
pub fn find_by_executable(exec_path: &Path) -> Vec<RunningProcess> {
    let target = crate::utils::exec_basename(exec_path);
    let own = std::process::id();
    get_running_processes()
        .into_iter()
        .filter(|p| p.pid != own && matches_executable(p, &target))
        .collect()
}

pub fn is_executable_running(exec_path: &Path) -> bool {
    !find_by_executable(exec_path).is_empty()
}

/// Zero-signal liveness check.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    use nix::sys::signal;
    use nix::unistd::Pid as NixPid;
    signal::kill(NixPid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn is_pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.process(sysinfo::Pid::from_u32(pid)).is_some()
}

/// Signal the whole process group led by `pid`. `force` selects SIGKILL over SIGTERM.
///
/// A `pid` that does not lead a group (`ESRCH`/`EPERM` from `killpg`) is
/// signalled on its own.
#[cfg(unix)]
pub fn kill_tree(pid: u32, force: bool) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;

    let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match signal::killpg(NixPid::from_raw(pid as i32), sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) | Err(Errno::EPERM) => kill_pid(pid, force),
        Err(e) => Err(format!("Failed to send {:?} to group {}: {}", sig, pid, e)),
    }
}

/// SIGKILL whatever is left in the group `pgid` after its leader exited.
/// Never falls back to the bare pid, which may already belong to someone else.
#[cfg(unix)]
pub fn kill_leftover_group(pgid: u32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;

    if signal::killpg(NixPid::from_raw(pgid as i32), Signal::SIGKILL).is_ok() {
        tracing::debug!("Killed leftover members of process group {}", pgid);
    }
}

#[cfg(not(unix))]
pub fn kill_leftover_group(_pgid: u32) {}

/// Signal exactly `pid`. An already-gone process counts as success.
#[cfg(unix)]
pub fn kill_pid(pid: u32, force: bool) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;

    let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match signal::kill(NixPid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(format!("Failed to send {:?} to {}: {}", sig, pid, e)),
    }
}

#[cfg(windows)]
pub fn kill_pid(pid: u32, _force: bool) -> Result<(), String> {
    if !is_pid_alive(pid) {
        return Ok(());
    }
    terminate_pid(pid)
}

#[cfg(windows)]
pub fn kill_tree(pid: u32, _force: bool) -> Result<(), String> {
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map_err(|e| format!("Failed to run taskkill for {}: {}", pid, e))?;
    if status.success() || !is_pid_alive(pid) {
        Ok(())
    } else {
        terminate_pid(pid)
    }
}

#[cfg(windows)]
fn terminate_pid(pid: u32) -> Result<(), String> {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
    use winapi::um::winnt::PROCESS_TERMINATE;

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            return Err(format!("Failed to open process {}", pid));
        }
        let result = TerminateProcess(handle, 1);
        CloseHandle(handle);
        if result == 0 {
            return Err(format!("TerminateProcess failed for {}", pid));
        }
    }
    Ok(())
}

/// Kill every process matching `exec_path`'s basename. Returns how many were signalled.
///
/// Orphans usually sit in someone else's process group, so each match is
/// signalled by pid rather than by group.
pub fn kill_by_executable(exec_path: &Path) -> usize {
    let mut killed = 0;
    for p in find_by_executable(exec_path) {
        match kill_pid(p.pid, true) {
            Ok(()) => {
                tracing::info!("Killed orphaned '{}' (pid {})", p.name, p.pid);
                killed += 1;
            }
            Err(e) => tracing::warn!("{}", e),
        }
    }
    killed
}

// ── Async wrappers ─────────────────────────────────────────
// sysinfo는 프로세스 테이블 전체를 동기 스캔하므로 블로킹 스레드풀에서 실행합니다.

pub async fn is_executable_running_async(exec_path: &Path) -> bool {
    let exec_path = exec_path.to_path_buf();
    tokio::task::spawn_blocking(move || is_executable_running(&exec_path))
        .await
        .unwrap_or(false)
}

pub async fn kill_by_executable_async(exec_path: &Path) -> usize {
    let exec_path = exec_path.to_path_buf();
    tokio::task::spawn_blocking(move || kill_by_executable(&exec_path))
        .await
        .unwrap_or(0)
}

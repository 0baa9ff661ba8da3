//! Error taxonomy shared by the catalog, install pipeline and supervisor.
//!
//! Every public operation returns `Result<T, OrchestratorError>`. Cancellation
//! has its own variant so callers can tell "the user cancelled" from "it broke".

use axum::http::StatusCode;
use serde_json::json;

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("File system error: {0}")]
    Filesystem(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Registry unavailable: {0}")]
    State(String),

    #[error("Install of '{0}' was cancelled")]
    Cancelled(String),
}

#[derive(thiserror::Error, Debug)]
pub enum NetworkError {
    #[error("Timed out after {secs}s: {operation}")]
    Timeout { operation: String, secs: u64 },

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Malformed manifest: {0}")]
    InvalidManifest(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("'{0}' is already being installed")]
    AlreadyInstalling(String),

    #[error("Cannot install '{app_id}': '{installed}' from group '{group}' is already installed")]
    GroupConflict {
        app_id: String,
        group: String,
        installed: String,
    },

    #[error("Unknown app '{0}'")]
    UnknownApp(String),

    #[error("Unknown version '{version}' for app '{app_id}'")]
    UnknownVersion { app_id: String, version: String },

    #[error("'{0}' is not installed")]
    NotInstalled(String),

    #[error("No install in progress for '{0}'")]
    NotInstalling(String),

    #[error("'{0}' is running; stop it before reinstalling")]
    AppRunning(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    #[error("'{app_id}' is already running (pid {pid})")]
    AlreadyRunning { app_id: String, pid: u32 },

    #[error("Failed to spawn '{app_id}': {message}")]
    SpawnFailed { app_id: String, message: String },

    #[error("'{app_id}' exited immediately ({status})")]
    ExitedEarly {
        app_id: String,
        status: String,
        recent_logs: Vec<String>,
    },

    #[error("Failed to kill '{app_id}': {message}")]
    KillFailed { app_id: String, message: String },

    #[error("Data directory initialization for '{app_id}' failed: {message}")]
    InitFailed { app_id: String, message: String },
}

impl OrchestratorError {
    pub fn fs(operation: &str, path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        Self::Filesystem(format!("{} '{}': {}", operation, path.display(), err))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Network(_) => StatusCode::BAD_GATEWAY,
            Self::Filesystem(_) | Self::Archive(_) | Self::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Cancelled(_) => StatusCode::OK,
            Self::Process(ProcessError::AlreadyRunning { .. }) => StatusCode::CONFLICT,
            Self::Process(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Validation(ValidationError::UnknownApp(_))
            | Self::Validation(ValidationError::UnknownVersion { .. })
            | Self::Validation(ValidationError::NotInstalled(_))
            | Self::Validation(ValidationError::NotInstalling(_)) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::CONFLICT,
        }
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Network(NetworkError::Timeout { .. }) => "NETWORK_TIMEOUT",
            Self::Network(_) => "NETWORK_ERROR",
            Self::Filesystem(_) => "FILESYSTEM_ERROR",
            Self::Archive(_) => "ARCHIVE_ERROR",
            Self::State(_) => "STATE_ERROR",
            Self::Cancelled(_) => "CANCELLED",
            Self::Process(e) => match e {
                ProcessError::AlreadyRunning { .. } => "ALREADY_RUNNING",
                ProcessError::SpawnFailed { .. } => "SPAWN_FAILED",
                ProcessError::ExitedEarly { .. } => "EXITED_EARLY",
                ProcessError::KillFailed { .. } => "KILL_FAILED",
                ProcessError::InitFailed { .. } => "INIT_FAILED",
            },
            Self::Validation(e) => match e {
                ValidationError::AlreadyInstalling(_) => "ALREADY_INSTALLING",
                ValidationError::GroupConflict { .. } => "GROUP_CONFLICT",
                ValidationError::UnknownApp(_) => "UNKNOWN_APP",
                ValidationError::UnknownVersion { .. } => "UNKNOWN_VERSION",
                ValidationError::NotInstalled(_) => "NOT_INSTALLED",
                ValidationError::NotInstalling(_) => "NOT_INSTALLING",
                ValidationError::AppRunning(_) => "APP_RUNNING",
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut body = json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
            "cancelled": self.is_cancelled(),
        });
        if let Self::Process(ProcessError::ExitedEarly { recent_logs, .. }) = self {
            body["recent_logs"] = json!(recent_logs);
        }
        body
    }
}

impl NetworkError {
    pub fn from_reqwest(err: &reqwest::Error, operation: &str, secs: u64) -> Self {
        if err.is_timeout() {
            NetworkError::Timeout {
                operation: operation.to_string(),
                secs,
            }
        } else if let Some(status) = err.status() {
            NetworkError::Status {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            NetworkError::Connection(err.to_string())
        }
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        Self::Filesystem(err.to_string())
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(NetworkError::from_reqwest(&err, "request", 0))
    }
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(err: rusqlite::Error) -> Self {
        Self::State(err.to_string())
    }
}

impl From<zip::result::ZipError> for OrchestratorError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::State(format!("invalid document: {}", err))
    }
}

impl axum::response::IntoResponse for OrchestratorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}

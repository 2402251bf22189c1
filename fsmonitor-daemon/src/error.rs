use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Error surface for the daemon runtime, IPC protocol and lifecycle control.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("config error: {0}")]
    Config(#[from] fsmonitor_core::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("fsmonitor daemon is already running for '{root}' (socket: {socket})")]
    AlreadyRunning { root: PathBuf, socket: PathBuf },

    #[error("fsmonitor daemon is not running (socket: {socket})")]
    NotRunning { socket: PathBuf },

    #[error("filesystem monitoring is not supported on this platform")]
    UnsupportedPlatform,

    #[error("'{root}' is not a watchable root: metadata directory {metadata} is missing")]
    MetadataMissing { root: PathBuf, metadata: PathBuf },

    #[error("daemon exited during startup ({status}); see {log}")]
    StartFailed { status: ExitStatus, log: PathBuf },

    #[error("daemon for '{root}' still answering {timeout_ms} ms after stop")]
    StopTimeout { root: PathBuf, timeout_ms: u64 },

    #[error("daemon did not become ready within {timeout_ms} ms; see {log}")]
    StartTimeout { timeout_ms: u64, log: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

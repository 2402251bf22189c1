//! Client-side lifecycle control: start a detached daemon, stop it, probe it,
//! and the implicit-start query used by collaborators that only want a
//! change list and fall back to a full scan on any trouble.

use std::fs::{self, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Instant;

use serde_json::Value;

use fsmonitor_core::{FsmonitorConfig, QueryRequest, QueryResponse, Token};

use crate::error::{io_err, DaemonError};
use crate::paths::{ensure_socket_dir, Endpoint, READY_POLL_INTERVAL, STOP_WAIT};
use crate::protocol::{probe, request_flush, request_query, request_status, request_stop};
use crate::watcher::{self, RootIdentity};

/// How to re-invoke the binary that hosts `--run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launcher {
    pub program: PathBuf,
}

impl Launcher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// The running executable; correct whenever the caller is `fsmonitor` itself.
    pub fn current_exe() -> Result<Self, DaemonError> {
        let program = std::env::current_exe().map_err(|e| io_err("current executable", e))?;
        Ok(Self::new(program))
    }

    fn command(&self, endpoint: &Endpoint, snapshot: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--run")
            .arg(&endpoint.root)
            .arg("--log-file")
            .arg(&endpoint.log)
            .arg("--config")
            .arg(snapshot);
        command
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    pub pid: u32,
    pub endpoint: Endpoint,
}

/// Start a detached daemon for `root` and wait until it answers.
pub fn start(
    root: &Path,
    config: &FsmonitorConfig,
    launcher: &Launcher,
) -> Result<Started, DaemonError> {
    if !watcher::is_supported() {
        return Err(DaemonError::UnsupportedPlatform);
    }

    let endpoint = Endpoint::resolve(root, config)?;
    RootIdentity::capture(&endpoint.root, &config.metadata_path(&endpoint.root))?;
    if probe(&endpoint.socket) {
        return Err(DaemonError::AlreadyRunning {
            root: endpoint.root,
            socket: endpoint.socket,
        });
    }

    let socket_dir = config.resolved_socket_dir();
    ensure_socket_dir(&socket_dir)?;
    let snapshot = write_config_snapshot(&endpoint, config, &socket_dir)?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&endpoint.log)
        .map_err(|e| io_err(&endpoint.log, e))?;

    let mut command = launcher.command(&endpoint, &snapshot);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log))
        .process_group(0);
    let child = command
        .spawn()
        .map_err(|e| io_err(&launcher.program, e))?;
    let pid = child.id();
    tracing::debug!(pid, root = %endpoint.root.display(), "spawned daemon");

    wait_until_ready(child, &endpoint, config)?;
    Ok(Started { pid, endpoint })
}

fn wait_until_ready(
    mut child: Child,
    endpoint: &Endpoint,
    config: &FsmonitorConfig,
) -> Result<(), DaemonError> {
    let deadline = Instant::now() + config.start_timeout();
    loop {
        if probe(&endpoint.socket) {
            // The daemon outlives us; reap it if it exits while we are still around.
            std::thread::spawn(move || child.wait());
            return Ok(());
        }

        if let Some(status) = child.try_wait().map_err(|e| io_err("daemon child", e))? {
            // Lost a start race: someone else's daemon owns the endpoint.
            if probe(&endpoint.socket) {
                return Err(DaemonError::AlreadyRunning {
                    root: endpoint.root.clone(),
                    socket: endpoint.socket.clone(),
                });
            }
            return Err(DaemonError::StartFailed {
                status,
                log: endpoint.log.clone(),
            });
        }

        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(DaemonError::StartTimeout {
                timeout_ms: config.start_timeout_ms,
                log: endpoint.log.clone(),
            });
        }
        std::thread::sleep(READY_POLL_INTERVAL);
    }
}

/// Resolved config the child runs with, so it matches what the caller saw.
fn write_config_snapshot(
    endpoint: &Endpoint,
    config: &FsmonitorConfig,
    socket_dir: &Path,
) -> Result<PathBuf, DaemonError> {
    let snapshot = FsmonitorConfig {
        socket_dir: Some(socket_dir.to_path_buf()),
        ..config.clone()
    };
    let path = endpoint.socket.with_extension("yaml");
    let body = serde_yaml::to_string(&snapshot)?;
    fs::write(&path, body).map_err(|e| io_err(&path, e))?;
    Ok(path)
}

/// Ask the daemon for `root` to stop and wait until it no longer answers.
pub fn stop(root: &Path, config: &FsmonitorConfig) -> Result<Endpoint, DaemonError> {
    let endpoint = Endpoint::resolve(root, config)?;
    request_stop(&endpoint.socket)?;

    let deadline = Instant::now() + STOP_WAIT;
    while probe(&endpoint.socket) {
        if Instant::now() >= deadline {
            return Err(DaemonError::StopTimeout {
                root: endpoint.root,
                timeout_ms: STOP_WAIT.as_millis() as u64,
            });
        }
        std::thread::sleep(READY_POLL_INTERVAL);
    }
    Ok(endpoint)
}

pub fn is_running(root: &Path, config: &FsmonitorConfig) -> bool {
    Endpoint::resolve(root, config)
        .map(|endpoint| probe(&endpoint.socket))
        .unwrap_or(false)
}

pub fn query(
    root: &Path,
    config: &FsmonitorConfig,
    request: &QueryRequest,
) -> Result<QueryResponse, DaemonError> {
    let endpoint = Endpoint::resolve(root, config)?;
    request_query(&endpoint.socket, request)
}

pub fn flush(root: &Path, config: &FsmonitorConfig) -> Result<Token, DaemonError> {
    let endpoint = Endpoint::resolve(root, config)?;
    request_flush(&endpoint.socket)
}

pub fn status(root: &Path, config: &FsmonitorConfig) -> Result<Value, DaemonError> {
    let endpoint = Endpoint::resolve(root, config)?;
    request_status(&endpoint.socket)
}

/// What an implicit-start caller gets back. Never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    Changes(QueryResponse),
    /// The daemon could not answer; treat every path as changed.
    FullScan { reason: String },
}

impl QueryOutcome {
    pub fn is_full_scan(&self) -> bool {
        match self {
            QueryOutcome::Changes(response) => response.rescan,
            QueryOutcome::FullScan { .. } => true,
        }
    }
}

/// Probe, start the daemon if nothing answers, then issue exactly one query.
pub fn query_or_start(
    root: &Path,
    config: &FsmonitorConfig,
    launcher: &Launcher,
    request: &QueryRequest,
) -> QueryOutcome {
    let attempt = || -> Result<QueryResponse, DaemonError> {
        let endpoint = Endpoint::resolve(root, config)?;
        if !probe(&endpoint.socket) {
            match start(root, config, launcher) {
                Ok(started) => tracing::debug!(pid = started.pid, "implicitly started daemon"),
                Err(DaemonError::AlreadyRunning { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        request_query(&endpoint.socket, request)
    };

    match attempt() {
        Ok(response) => QueryOutcome::Changes(response),
        Err(err) => {
            tracing::warn!(root = %root.display(), error = %err, "daemon unavailable, full scan");
            QueryOutcome::FullScan {
                reason: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::runtime;
    use crate::state::ShutdownReason;

    struct Scratch {
        _dirs: (TempDir, TempDir),
        root: PathBuf,
        config: FsmonitorConfig,
    }

    fn scratch() -> Scratch {
        let work = TempDir::new().expect("root");
        let sockets = TempDir::new().expect("sockets");
        let root = fs::canonicalize(work.path()).expect("canonicalize");
        fs::create_dir(root.join(".git")).expect("mkdir .git");
        let config = FsmonitorConfig {
            socket_dir: Some(sockets.path().to_path_buf()),
            deterministic_token: true,
            ..FsmonitorConfig::default()
        };
        Scratch {
            _dirs: (work, sockets),
            root,
            config,
        }
    }

    /// In-process daemon on its own runtime thread.
    fn spawn_daemon(
        scratch: &Scratch,
    ) -> std::thread::JoinHandle<Result<ShutdownReason, DaemonError>> {
        let root = scratch.root.clone();
        let config = scratch.config.clone();
        let handle = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("runtime");
            rt.block_on(runtime::run(root, config, None))
        });
        for _ in 0..200 {
            if is_running(&scratch.root, &scratch.config) {
                return handle;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        panic!("daemon never became ready");
    }

    #[test]
    fn stop_without_daemon_is_not_running() {
        let s = scratch();
        assert!(!is_running(&s.root, &s.config));
        let err = stop(&s.root, &s.config).unwrap_err();
        assert!(matches!(err, DaemonError::NotRunning { .. }), "got: {err}");
    }

    #[test]
    fn start_rejects_root_without_metadata() {
        let s = scratch();
        fs::remove_dir(s.root.join(".git")).expect("rm .git");
        let err = start(&s.root, &s.config, &Launcher::new("false")).unwrap_err();
        assert!(matches!(err, DaemonError::MetadataMissing { .. }), "got: {err}");
    }

    #[test]
    fn child_exit_during_startup_is_start_failed() {
        let s = scratch();
        let err = start(&s.root, &s.config, &Launcher::new("false")).unwrap_err();
        assert!(matches!(err, DaemonError::StartFailed { .. }), "got: {err}");
    }

    #[test]
    fn implicit_start_failure_falls_back_to_full_scan() {
        let s = scratch();
        let launcher = Launcher::new(s.root.join("no-such-binary"));
        let outcome = query_or_start(&s.root, &s.config, &launcher, &QueryRequest::Bootstrap);
        assert!(matches!(outcome, QueryOutcome::FullScan { .. }));
        assert!(outcome.is_full_scan());
    }

    #[test]
    fn implicit_start_uses_running_daemon() {
        let s = scratch();
        let daemon = spawn_daemon(&s);

        let launcher = Launcher::new("false");
        let token = Token::new("test", 0, 0);
        let outcome = query_or_start(&s.root, &s.config, &launcher, &QueryRequest::Since(token));
        match outcome {
            QueryOutcome::Changes(response) => {
                assert!(!response.rescan);
                assert_eq!(response.token.run_id, "test");
            }
            other => panic!("expected changes, got {other:?}"),
        }

        stop(&s.root, &s.config).expect("stop");
        let reason = daemon.join().expect("join").expect("daemon");
        assert_eq!(reason, ShutdownReason::ClientStop);
    }

    #[test]
    fn start_against_running_daemon_is_already_running() {
        let s = scratch();
        let daemon = spawn_daemon(&s);

        let err = start(&s.root, &s.config, &Launcher::new("false")).unwrap_err();
        assert!(err.to_string().contains("already running"), "got: {err}");

        let token = flush(&s.root, &s.config).expect("flush");
        assert_eq!(token, Token::new("test", 1, 0));
        let status = status(&s.root, &s.config).expect("status");
        assert_eq!(status["token"], ":internal:test:1:0");

        stop(&s.root, &s.config).expect("stop");
        daemon.join().expect("join").expect("daemon");
        assert!(!is_running(&s.root, &s.config));
    }
}

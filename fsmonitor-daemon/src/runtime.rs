use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::fmt::MakeWriter;

use fsmonitor_core::FsmonitorConfig;

use crate::error::{io_err, DaemonError};
use crate::listener::{self, socket_server_task};
use crate::paths::{ensure_socket_dir, Endpoint, IDLE_CHECK_INTERVAL, LOG_ROTATION_INTERVAL};
use crate::state::{DaemonState, LifecycleState, ShutdownReason};
use crate::watcher::{self, watcher_task, RawEvent, RootIdentity, WatchHandle};

/// Environment switch for JSON log lines.
pub const ENV_LOG_JSON: &str = "FSMONITOR_LOG_JSON";

/// Run the daemon for `root` and block the current thread until it exits.
///
/// `log_file` is set when the daemon runs detached; logs then go to that
/// file (rotated in place) instead of stderr.
pub fn start_blocking(
    root: &Path,
    config: FsmonitorConfig,
    log_file: Option<PathBuf>,
) -> Result<ShutdownReason, DaemonError> {
    init_tracing(log_file.clone());
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(root.to_path_buf(), config, log_file))
}

/// Run the daemon: verify the root, claim the endpoint, subscribe, serve.
///
/// Every check that can fail runs before the socket is bound, so a failed
/// start never disturbs a daemon that already owns the endpoint.
pub async fn run(
    root: PathBuf,
    config: FsmonitorConfig,
    log_file: Option<PathBuf>,
) -> Result<ShutdownReason, DaemonError> {
    if !watcher::is_supported() {
        return Err(DaemonError::UnsupportedPlatform);
    }

    let endpoint = Endpoint::resolve(&root, &config)?;
    let identity = RootIdentity::capture(&endpoint.root, &config.metadata_path(&endpoint.root))?;
    if let Some(dir) = endpoint.socket.parent() {
        ensure_socket_dir(dir)?;
    }
    listener::prepare_socket_for_bind(&endpoint)?;

    let state = Arc::new(DaemonState::new(endpoint, config)?);
    let (event_tx, event_rx) = mpsc::unbounded_channel::<RawEvent>();
    let handle = watcher::subscribe(state.config.backend, &state.endpoint.root, event_tx)?;
    let listener = listener::bind(&state.endpoint)?;

    let token = state.current_token().await;
    tracing::info!(
        root = %state.endpoint.root.display(),
        socket = %state.endpoint.socket.display(),
        token = %token,
        "fsmonitor daemon ready",
    );
    serve(state, listener, event_rx, Some(handle), identity, log_file).await
}

/// Drive a `Starting` state to `Stopped`: spawn every task and wait for all
/// of them. The socket task owns removal of the endpoint socket.
pub(crate) async fn serve(
    state: Arc<DaemonState>,
    listener: UnixListener,
    events: mpsc::UnboundedReceiver<RawEvent>,
    handle: Option<WatchHandle>,
    identity: RootIdentity,
    log_file: Option<PathBuf>,
) -> Result<ShutdownReason, DaemonError> {
    state.advance_to(LifecycleState::Running)?;
    let shutdown_tx = state.shutdown_sender();

    let watcher_handle = {
        let state = state.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let result = watcher_task(state.clone(), events, identity, handle, shutdown_rx).await;
            state.request_shutdown(ShutdownReason::TaskExit("watcher".to_string()));
            result
        })
    };

    let socket_handle = {
        let state = state.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let result = socket_server_task(state.clone(), listener, shutdown_rx).await;
            state.request_shutdown(ShutdownReason::TaskExit("socket_server".to_string()));
            result
        })
    };

    let idle_handle = {
        let state = state.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { idle_task(state, shutdown_rx).await })
    };

    let rotation_handle = {
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { log_rotation_task(log_file, shutdown_rx).await })
    };

    let signal_handle = {
        let state = state.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => Ok::<(), DaemonError>(()),
                signal = wait_for_signal() => {
                    signal.map_err(|e| io_err("signal handler", e))?;
                    tracing::info!("received termination signal");
                    state.request_shutdown(ShutdownReason::Signal);
                    Ok(())
                }
            }
        })
    };

    let (watcher_result, socket_result, idle_result, rotation_result, signal_result) = tokio::join!(
        watcher_handle,
        socket_handle,
        idle_handle,
        rotation_handle,
        signal_handle
    );

    handle_join("watcher", watcher_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("idle_timer", idle_result)?;
    handle_join("log_rotation", rotation_result)?;
    handle_join("signal_handler", signal_result)?;

    state.advance_to(LifecycleState::Stopped)?;
    let reason = state
        .shutdown_reason()
        .unwrap_or_else(|| ShutdownReason::TaskExit("unknown".to_string()));
    tracing::info!(reason = %reason, "fsmonitor daemon stopped");
    Ok(reason)
}

async fn idle_task(
    state: Arc<DaemonState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let Some(timeout) = state.config.idle_timeout() else {
        let _ = shutdown_rx.recv().await;
        return Ok(());
    };

    let mut interval = tokio::time::interval(IDLE_CHECK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                if state.idle_for() >= timeout {
                    tracing::info!(idle_secs = timeout.as_secs(), "no requests within idle timeout");
                    state.request_shutdown(ShutdownReason::IdleTimeout);
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn log_rotation_task(
    log_file: Option<PathBuf>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let Some(log_file) = log_file else {
        let _ = shutdown_rx.recv().await;
        return Ok(());
    };

    let mut interval = tokio::time::interval(LOG_ROTATION_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let path = log_file.clone();
                tokio::task::spawn_blocking(move || crate::log_rotation::rotate_log(&path))
                    .await
                    .ok();
            }
        }
    }
    Ok(())
}

async fn wait_for_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// Writer that reopens the log for every line so rotation never strands it.
struct LogFile {
    path: PathBuf,
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = Box<dyn Write + 'a>;

    fn make_writer(&'a self) -> Self::Writer {
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(file) => Box::new(file) as Box<dyn Write>,
            Err(_) => Box::new(io::sink()),
        }
    }
}

fn init_tracing(log_file: Option<PathBuf>) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var_os(ENV_LOG_JSON).is_some();
    let builder = fmt().with_env_filter(filter).with_target(false);

    let _ = match (log_file, json) {
        (Some(path), true) => builder
            .json()
            .with_ansi(false)
            .with_writer(LogFile { path })
            .try_init(),
        (Some(path), false) => builder
            .with_ansi(false)
            .with_writer(LogFile { path })
            .try_init(),
        (None, true) => builder.json().with_writer(io::stderr).try_init(),
        (None, false) => builder.with_writer(io::stderr).try_init(),
    };
}

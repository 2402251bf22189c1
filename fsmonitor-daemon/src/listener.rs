//! Unix-socket IPC listener.
//!
//! Requests and responses are single JSON lines (see [`crate::protocol`]).
//! Each connection gets its own task; a client may send several requests
//! on one connection, and `stop` ends it.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use fsmonitor_core::QueryRequest;

use crate::error::{io_err, DaemonError};
use crate::paths::Endpoint;
use crate::protocol::{DaemonRequest, DaemonResponse, FlushData};
use crate::state::{DaemonState, FlushReason, ShutdownReason};

/// Fail with `AlreadyRunning` if something answers on the socket; otherwise
/// clear a stale socket file so bind can succeed.
pub fn prepare_socket_for_bind(endpoint: &Endpoint) -> Result<(), DaemonError> {
    let socket = &endpoint.socket;
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::AlreadyRunning {
                root: endpoint.root.clone(),
                socket: socket.clone(),
            });
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

/// Bind the endpoint socket (mode `0600`). Must run inside a tokio runtime.
pub fn bind(endpoint: &Endpoint) -> Result<UnixListener, DaemonError> {
    let listener = UnixListener::bind(&endpoint.socket).map_err(|err| {
        if err.kind() == ErrorKind::AddrInUse {
            DaemonError::AlreadyRunning {
                root: endpoint.root.clone(),
                socket: endpoint.socket.clone(),
            }
        } else {
            io_err(&endpoint.socket, err)
        }
    })?;
    set_socket_permissions(&endpoint.socket)?;
    Ok(listener)
}

pub(crate) async fn socket_server_task(
    state: Arc<DaemonState>,
    listener: UnixListener,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = state.endpoint.socket.clone();

    let result = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break Ok(()),
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(err) => break Err(io_err(&socket, err)),
                };
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_client(stream, state).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    };

    // The only place a daemon removes its own socket.
    drop(listener);
    remove_socket(&socket);
    result
}

async fn handle_client(stream: UnixStream, state: Arc<DaemonState>) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request: {err}")),
                )
                .await?;
                continue;
            }
        };

        if request.is_activity() {
            state.touch();
        }
        tracing::debug!(cmd = request.name(), "client request");
        let response = dispatch(&state, &request).await;
        write_response(&mut writer, &response).await?;
        if request == DaemonRequest::Stop {
            break;
        }
    }

    Ok(())
}

async fn dispatch(state: &DaemonState, request: &DaemonRequest) -> DaemonResponse {
    match request {
        DaemonRequest::Query { token } => {
            let response = state.query(&QueryRequest::from_text(token)).await;
            match serde_json::to_value(&response) {
                Ok(data) => DaemonResponse::ok(data),
                Err(err) => DaemonResponse::error(format!("encode query response: {err}")),
            }
        }
        DaemonRequest::Flush => {
            let token = state.flush(FlushReason::Client).await;
            DaemonResponse::ok(json!(FlushData { token }))
        }
        DaemonRequest::Stop => {
            state.request_shutdown(ShutdownReason::ClientStop);
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        DaemonRequest::IsRunning => DaemonResponse::ok(json!({
            "running": true,
            "root": state.endpoint.root.display().to_string(),
        })),
        DaemonRequest::Status => DaemonResponse::ok(state.status().await),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let mut payload = serde_json::to_vec(response)?;
    payload.push(b'\n');
    writer
        .write_all(&payload)
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

pub(crate) fn remove_socket(socket: &Path) {
    match fs::remove_file(socket) {
        Ok(()) => tracing::debug!(socket = %socket.display(), "socket removed"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(socket = %socket.display(), error = %err, "socket removal failed"),
    }
}

fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use fsmonitor_core::{QueryRequest, QueryResponse, Token};

use crate::error::{io_err, DaemonError};
use crate::paths::CLIENT_IO_TIMEOUT;

/// JSON newline-delimited request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonRequest {
    /// Token text as the client has it; anything unparseable means bootstrap.
    Query { token: String },
    Flush,
    Stop,
    IsRunning,
    Status,
}

impl DaemonRequest {
    pub fn name(&self) -> &'static str {
        match self {
            DaemonRequest::Query { .. } => "query",
            DaemonRequest::Flush => "flush",
            DaemonRequest::Stop => "stop",
            DaemonRequest::IsRunning => "is_running",
            DaemonRequest::Status => "status",
        }
    }

    /// Whether the request counts as client activity for the idle timer.
    /// Liveness checks and stop never do.
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            DaemonRequest::Query { .. } | DaemonRequest::Flush | DaemonRequest::Status
        )
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushData {
    pub token: Token,
}

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(socket: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    if !socket.exists() {
        return Err(DaemonError::NotRunning {
            socket: socket.to_path_buf(),
        });
    }

    let mut stream = UnixStream::connect(socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::NotRunning {
                socket: socket.to_path_buf(),
            }
        } else {
            io_err(socket, err)
        }
    })?;
    stream
        .set_read_timeout(Some(CLIENT_IO_TIMEOUT))
        .map_err(|e| io_err(socket, e))?;
    stream
        .set_write_timeout(Some(CLIENT_IO_TIMEOUT))
        .map_err(|e| io_err(socket, e))?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(socket, e))?;
    stream.flush().map_err(|e| io_err(socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader.read_line(&mut line).map_err(|e| io_err(socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

/// Liveness probe. Never mutates daemon state.
pub fn probe(socket: &Path) -> bool {
    matches!(
        send_request(socket, &DaemonRequest::IsRunning),
        Ok(DaemonResponse { ok: true, .. })
    )
}

pub fn request_query(socket: &Path, request: &QueryRequest) -> Result<QueryResponse, DaemonError> {
    let response = send_request(
        socket,
        &DaemonRequest::Query {
            token: request.to_text(),
        },
    )?;
    Ok(serde_json::from_value(response_into_data(response)?)?)
}

pub fn request_flush(socket: &Path) -> Result<Token, DaemonError> {
    let response = send_request(socket, &DaemonRequest::Flush)?;
    let data: FlushData = serde_json::from_value(response_into_data(response)?)?;
    Ok(data.token)
}

pub fn request_stop(socket: &Path) -> Result<(), DaemonError> {
    let response = send_request(socket, &DaemonRequest::Stop)?;
    response_into_data(response).map(|_| ())
}

pub fn request_status(socket: &Path) -> Result<Value, DaemonError> {
    let response = send_request(socket, &DaemonRequest::Status)?;
    response_into_data(response)
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}

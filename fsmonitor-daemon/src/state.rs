//! Process-scoped daemon state: endpoint, journal, lifecycle, shutdown.
//!
//! One `DaemonState` exists per daemon process. It is created by
//! [`crate::runtime::run`] once the root checks out, shared by every task
//! through an `Arc`, and dropped when the runtime returns.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

use fsmonitor_core::{FsmonitorConfig, Journal, QueryRequest, QueryResponse, Token};

use crate::error::DaemonError;
use crate::paths::Endpoint;
use crate::watcher::TraceSink;

/// `Stopped → Starting → Running → Stopping → Stopped`, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl LifecycleState {
    pub fn next(self) -> LifecycleState {
        match self {
            LifecycleState::Stopped => LifecycleState::Starting,
            LifecycleState::Starting => LifecycleState::Running,
            LifecycleState::Running => LifecycleState::Stopping,
            LifecycleState::Stopping => LifecycleState::Stopped,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// Why the daemon is going away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    ClientStop,
    /// The metadata directory or the root itself was deleted, renamed or replaced.
    RootLost,
    IdleTimeout,
    Signal,
    /// A task ended on its own (error or closed channel).
    TaskExit(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::ClientStop => f.write_str("stop requested by client"),
            ShutdownReason::RootLost => f.write_str("watch root metadata directory lost"),
            ShutdownReason::IdleTimeout => f.write_str("idle timeout"),
            ShutdownReason::Signal => f.write_str("signal"),
            ShutdownReason::TaskExit(task) => write!(f, "{task} task exited"),
        }
    }
}

/// What started a new journal epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Client,
    /// The backend reported dropped notifications.
    Overflow,
    /// The backend reported an error; events may have been lost.
    BackendError,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FlushReason::Client => "client",
            FlushReason::Overflow => "overflow",
            FlushReason::BackendError => "backend_error",
        };
        f.write_str(label)
    }
}

pub struct DaemonState {
    pub endpoint: Endpoint,
    pub config: FsmonitorConfig,
    journal: RwLock<Journal>,
    lifecycle: Mutex<LifecycleState>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_reason: Mutex<Option<ShutdownReason>>,
    last_activity: Mutex<Instant>,
    trace: Option<TraceSink>,
    started_at: DateTime<Utc>,
}

impl DaemonState {
    /// New state in `Starting`. Opens the trace sink when configured.
    pub fn new(endpoint: Endpoint, config: FsmonitorConfig) -> Result<Self, DaemonError> {
        let trace = config
            .trace_path
            .as_deref()
            .map(TraceSink::open)
            .transpose()?;
        let journal = Journal::new(config.deterministic_token, config.journal_limit);
        let (shutdown_tx, _) = broadcast::channel::<()>(16);

        Ok(Self {
            endpoint,
            config,
            journal: RwLock::new(journal),
            lifecycle: Mutex::new(LifecycleState::Starting),
            shutdown_tx,
            shutdown_reason: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            trace,
            started_at: Utc::now(),
        })
    }

    pub fn lifecycle(&self) -> LifecycleState {
        *lock(&self.lifecycle)
    }

    /// Move to `to`, which must be the immediate successor of the current state.
    pub fn advance_to(&self, to: LifecycleState) -> Result<(), DaemonError> {
        let mut current = lock(&self.lifecycle);
        if current.next() != to {
            return Err(DaemonError::Protocol(format!(
                "invalid lifecycle transition {} -> {to}",
                *current
            )));
        }
        tracing::debug!(from = %*current, to = %to, "lifecycle transition");
        *current = to;
        Ok(())
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Record why we are stopping (first reason wins) and wake every task.
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        {
            let mut slot = lock(&self.shutdown_reason);
            if slot.is_none() {
                tracing::info!(reason = %reason, "daemon shutting down");
                *slot = Some(reason);
            }
        }
        if self.lifecycle() == LifecycleState::Running {
            let _ = self.advance_to(LifecycleState::Stopping);
        }
        let _ = self.shutdown_tx.send(());
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        lock(&self.shutdown_reason).clone()
    }

    pub fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    /// Append normalized paths under the journal write lock.
    pub async fn record(&self, paths: Vec<String>) {
        if paths.is_empty() {
            return;
        }
        let appended = {
            let mut journal = self.journal.write().await;
            journal.append_batch(paths.iter().cloned())
        };
        if appended.limit_flushed {
            tracing::warn!(
                limit = self.config.journal_limit,
                token = %appended.token,
                "journal limit reached, started new epoch",
            );
        }
        if let Some(trace) = &self.trace {
            trace.record(&paths);
        }
        tracing::trace!(count = paths.len(), token = %appended.token, "journaled paths");
    }

    /// Answer a query from one consistent journal snapshot. The settle delay
    /// runs before the read lock is taken, so ingestion is never blocked.
    pub async fn query(&self, request: &QueryRequest) -> QueryResponse {
        let delay = self.config.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let response = self.journal.read().await.query(request);
        if response.rescan {
            tracing::debug!(
                requested = %request.to_text(),
                token = %response.token,
                "unknown token, answering rescan",
            );
        }
        response
    }

    pub async fn flush(&self, reason: FlushReason) -> Token {
        let token = self.journal.write().await.flush();
        tracing::info!(reason = %reason, token = %token, "journal flushed");
        token
    }

    pub async fn current_token(&self) -> Token {
        self.journal.read().await.current_token()
    }

    pub async fn status(&self) -> Value {
        let (token, entries) = {
            let journal = self.journal.read().await;
            (journal.current_token(), journal.len())
        };
        json!({
            "running": true,
            "pid": std::process::id(),
            "root": self.endpoint.root.display().to_string(),
            "socket": self.endpoint.socket.display().to_string(),
            "state": self.lifecycle(),
            "token": token,
            "journal_entries": entries,
            "backend": self.config.backend,
            "started_at": self.started_at.to_rfc3339(),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn state() -> DaemonState {
        let endpoint = Endpoint::for_root(Path::new("/work/repo"), Path::new("/tmp"));
        let config = FsmonitorConfig {
            deterministic_token: true,
            ..FsmonitorConfig::default()
        };
        DaemonState::new(endpoint, config).expect("state")
    }

    #[test]
    fn lifecycle_is_linear() {
        let state = state();
        assert_eq!(state.lifecycle(), LifecycleState::Starting);
        assert!(state.advance_to(LifecycleState::Stopping).is_err());
        state.advance_to(LifecycleState::Running).expect("running");
        assert!(state.advance_to(LifecycleState::Running).is_err());
        state.advance_to(LifecycleState::Stopping).expect("stopping");
        state.advance_to(LifecycleState::Stopped).expect("stopped");
        assert!(state.advance_to(LifecycleState::Running).is_err());
    }

    #[tokio::test]
    async fn first_shutdown_reason_wins() {
        let state = state();
        state.advance_to(LifecycleState::Running).expect("running");
        let mut rx = state.subscribe_shutdown();

        state.request_shutdown(ShutdownReason::RootLost);
        state.request_shutdown(ShutdownReason::ClientStop);

        assert_eq!(state.shutdown_reason(), Some(ShutdownReason::RootLost));
        assert_eq!(state.lifecycle(), LifecycleState::Stopping);
        rx.recv().await.expect("shutdown signal");
    }

    #[tokio::test]
    async fn record_then_query_then_flush() {
        let state = state();
        let start = state.current_token().await;
        state
            .record(vec!["file_1".to_string(), "file_2".to_string()])
            .await;

        let response = state.query(&QueryRequest::Since(start.clone())).await;
        assert_eq!(response.paths, vec!["file_1", "file_2"]);

        let next = state.flush(FlushReason::Client).await;
        assert_eq!(next.generation, start.generation + 1);
        assert!(state.query(&QueryRequest::Since(start)).await.rescan);
        assert!(state.query(&QueryRequest::Since(next)).await.paths.is_empty());
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn idle_clock_resets_on_touch() {
        let state = state();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(state.idle_for() >= Duration::from_secs(30));
        state.touch();
        assert!(state.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn status_reports_token_and_state() {
        let state = state();
        state.advance_to(LifecycleState::Running).expect("running");
        let status = state.status().await;
        assert_eq!(status["running"], json!(true));
        assert_eq!(status["state"], json!("running"));
        assert_eq!(status["token"], json!(":internal:test:0:0"));
        assert_eq!(status["journal_entries"], json!(0));
        let started = status["started_at"].as_str().expect("started_at string");
        assert!(DateTime::parse_from_rfc3339(started).is_ok());
    }
}

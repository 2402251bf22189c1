//! fsmonitor daemon: watcher + change journal + socket server, and the
//! client side that starts, stops and queries it.

mod error;
pub mod lifecycle;
mod listener;
pub mod log_rotation;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod state;
pub mod watcher;

pub use error::DaemonError;
pub use lifecycle::{query_or_start, Launcher, QueryOutcome, Started};
pub use paths::Endpoint;
pub use protocol::{
    probe, request_flush, request_query, request_status, request_stop, send_request,
    DaemonRequest, DaemonResponse,
};
pub use runtime::{run, start_blocking};
pub use state::{LifecycleState, ShutdownReason};
pub use watcher::is_supported;

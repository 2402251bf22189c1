//! fsmonitor core library: tokens, the change journal, configuration.
//!
//! Public API surface:
//! - [`token`]: [`Token`] text form and [`QueryRequest`]
//! - [`journal`]: [`Journal`] and [`QueryResponse`]
//! - [`config`]: [`FsmonitorConfig`] resolution
//! - [`error`]: [`TokenError`], [`ConfigError`]

pub mod config;
pub mod error;
pub mod journal;
pub mod token;

pub use config::{BackendKind, FsmonitorConfig};
pub use error::{ConfigError, TokenError};
pub use journal::{Appended, Journal, QueryResponse};
pub use token::{Epoch, QueryRequest, Token};

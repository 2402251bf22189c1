//! Error types for fsmonitor-core.

use std::path::PathBuf;

use thiserror::Error;

/// Failure to parse the text form of a [`Token`](crate::token::Token).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// The text does not start with the `:internal:` prefix.
    #[error("token '{0}' is missing the ':internal:' prefix")]
    MissingPrefix(String),

    /// Wrong number of `:`-separated fields after the prefix.
    #[error("token '{0}' must have the form :internal:<run_id>:<generation>:<seq_nr>")]
    Shape(String),

    /// `run_id` is empty.
    #[error("token '{0}' has an empty run id")]
    EmptyRunId(String),

    /// `generation` or `seq_nr` is not an unsigned integer.
    #[error("token '{text}' has a non-numeric {field}")]
    NotNumeric { text: String, field: &'static str },
}

/// All errors that can arise while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure reading a config file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error; includes file path and serde_yaml's line context.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// An environment override could not be parsed.
    #[error("invalid value '{value}' for {var}")]
    Env { var: &'static str, value: String },

    /// A field holds a value the daemon cannot run with.
    #[error("invalid config: {0}")]
    Invalid(String),
}

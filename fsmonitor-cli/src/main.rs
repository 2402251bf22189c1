//! fsmonitor: per-repository filesystem monitor daemon and client.
//!
//! # Usage
//!
//! ```text
//! fsmonitor --is-supported
//! fsmonitor --start [path]
//! fsmonitor --stop [path]
//! fsmonitor --is-running [path]
//! fsmonitor --status [path] [--json]
//! fsmonitor --query <token> [--auto-start] [--root <path>]
//! fsmonitor --flush [--root <path>]
//! fsmonitor --run [path]
//! ```

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{ArgGroup, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "fsmonitor",
    version,
    about = "Watch a repository and answer \"what changed since token T\"",
    long_about = None,
)]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .args(["is_supported", "start", "stop", "is_running", "status", "query", "flush", "run"]),
))]
pub struct Cli {
    /// Exit 0 if filesystem monitoring works on this platform.
    #[arg(long)]
    pub is_supported: bool,

    /// Start a background daemon for PATH (default: the current repository).
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    pub start: Option<Option<PathBuf>>,

    /// Stop the daemon for PATH.
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    pub stop: Option<Option<PathBuf>>,

    /// Exit 0 if a daemon is answering for PATH.
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    pub is_running: Option<Option<PathBuf>>,

    /// Print daemon status for PATH.
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    pub status: Option<Option<PathBuf>>,

    /// Print paths changed since TOKEN (header line, then NUL-terminated paths).
    #[arg(long, value_name = "TOKEN", allow_hyphen_values = true)]
    pub query: Option<String>,

    /// Start a new journal epoch and print its token.
    #[arg(long)]
    pub flush: bool,

    /// Run the daemon for PATH in the foreground.
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    pub run: Option<Option<PathBuf>>,

    /// With --query: start the daemon if needed and fall back to a full scan
    /// instead of failing.
    #[arg(long, requires = "query")]
    pub auto_start: bool,

    /// With --status: print JSON.
    #[arg(long, requires = "status")]
    pub json: bool,

    /// Repository root for --query and --flush.
    #[arg(long, value_name = "PATH")]
    pub root: Option<PathBuf>,

    /// YAML configuration file.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Daemon log file (set by --start for the detached daemon).
    #[arg(long, value_name = "FILE", requires = "run", hide = true)]
    pub log_file: Option<PathBuf>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();

    if cli.is_supported {
        return Ok(commands::daemon::is_supported());
    }
    if let Some(path) = &cli.start {
        return commands::daemon::start(path.as_deref(), config);
    }
    if let Some(path) = &cli.stop {
        return commands::daemon::stop(path.as_deref(), config);
    }
    if let Some(path) = &cli.is_running {
        return commands::daemon::is_running(path.as_deref(), config);
    }
    if let Some(path) = &cli.status {
        return commands::daemon::status(path.as_deref(), config, cli.json);
    }
    if let Some(path) = &cli.run {
        return commands::daemon::run(path.as_deref(), config, cli.log_file.clone());
    }
    if let Some(token) = &cli.query {
        return commands::query::query(token, cli.root.as_deref(), config, cli.auto_start);
    }
    commands::query::flush(cli.root.as_deref(), config)
}

//! `fsmonitor --query <token>` and `fsmonitor --flush`

use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};

use fsmonitor_core::journal::RESCAN_MARKER;
use fsmonitor_core::QueryRequest;
use fsmonitor_daemon::{lifecycle, query_or_start, Launcher, QueryOutcome};

use super::resolve_root;

pub fn query(
    token: &str,
    root: Option<&Path>,
    config_file: Option<&Path>,
    auto_start: bool,
) -> Result<ExitCode> {
    let (root, config) = resolve_root(root, config_file)?;
    let request = QueryRequest::from_text(token);

    let wire = if auto_start {
        let launcher = Launcher::current_exe().context("failed to locate fsmonitor executable")?;
        match query_or_start(&root, &config, &launcher, &request) {
            QueryOutcome::Changes(response) => response.to_wire(),
            // No daemon token exists here: the header echoes the request in
            // canonical form, a parsed token or the bootstrap sentinel.
            QueryOutcome::FullScan { reason } => {
                eprintln!("fsmonitor: {reason}; reporting full scan");
                format!("{}\n{RESCAN_MARKER}\0", request.to_text())
            }
        }
    } else {
        lifecycle::query(&root, &config, &request)
            .with_context(|| format!("failed to query daemon for {}", root.display()))?
            .to_wire()
    };

    let mut stdout = io::stdout().lock();
    stdout
        .write_all(wire.as_bytes())
        .and_then(|()| stdout.flush())
        .context("failed to write query response")?;
    Ok(ExitCode::SUCCESS)
}

pub fn flush(root: Option<&Path>, config_file: Option<&Path>) -> Result<ExitCode> {
    let (root, config) = resolve_root(root, config_file)?;
    let token = lifecycle::flush(&root, &config)
        .with_context(|| format!("failed to flush daemon for {}", root.display()))?;
    println!("{token}");
    Ok(ExitCode::SUCCESS)
}

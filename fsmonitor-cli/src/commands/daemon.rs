//! `fsmonitor --start|--stop|--is-running|--status|--run|--is-supported`

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::Value;

use fsmonitor_daemon::{lifecycle, start_blocking, DaemonError, Endpoint, Launcher};

use super::resolve_root;

pub fn is_supported() -> ExitCode {
    if fsmonitor_daemon::is_supported() {
        println!("filesystem monitoring is supported");
        ExitCode::SUCCESS
    } else {
        println!("filesystem monitoring is not supported on this platform");
        ExitCode::FAILURE
    }
}

pub fn start(path: Option<&Path>, config_file: Option<&Path>) -> Result<ExitCode> {
    let (root, config) = resolve_root(path, config_file)?;
    let launcher = Launcher::current_exe().context("failed to locate fsmonitor executable")?;
    let started = lifecycle::start(&root, &config, &launcher)
        .with_context(|| format!("failed to start daemon for {}", root.display()))?;
    println!(
        "{} daemon for {} (pid {})",
        "started".green().bold(),
        started.endpoint.root.display(),
        started.pid
    );
    Ok(ExitCode::SUCCESS)
}

pub fn stop(path: Option<&Path>, config_file: Option<&Path>) -> Result<ExitCode> {
    let (root, config) = resolve_root(path, config_file)?;
    let endpoint = lifecycle::stop(&root, &config)
        .with_context(|| format!("failed to stop daemon for {}", root.display()))?;
    println!(
        "{} daemon for {}",
        "stopped".green().bold(),
        endpoint.root.display()
    );
    Ok(ExitCode::SUCCESS)
}

pub fn is_running(path: Option<&Path>, config_file: Option<&Path>) -> Result<ExitCode> {
    let (root, config) = resolve_root(path, config_file)?;
    if lifecycle::is_running(&root, &config) {
        println!("daemon is {} for {}", "running".green(), root.display());
        Ok(ExitCode::SUCCESS)
    } else {
        println!("daemon is {} for {}", "not running".yellow(), root.display());
        Ok(ExitCode::FAILURE)
    }
}

pub fn status(path: Option<&Path>, config_file: Option<&Path>, json: bool) -> Result<ExitCode> {
    let (root, config) = resolve_root(path, config_file)?;
    let status = match lifecycle::status(&root, &config) {
        Ok(status) => status,
        Err(DaemonError::NotRunning { socket }) => serde_json::json!({
            "running": false,
            "root": root.display().to_string(),
            "socket": socket.display().to_string(),
        }),
        Err(err) => return Err(err).context("failed to query daemon status"),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("failed to render daemon status JSON")?
        );
    } else {
        print_status(&status);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_status(status: &Value) {
    let field = |key: &str| match &status[key] {
        Value::String(text) => text.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    };

    if status["running"] != Value::Bool(true) {
        println!("{} {}", "■".yellow().bold(), "not running".bold());
        println!("  root:    {}", field("root"));
        println!("  socket:  {}", field("socket"));
        return;
    }

    println!("{} {}", "■".green().bold(), "running".bold());
    println!("  root:     {}", field("root"));
    println!("  socket:   {}", field("socket"));
    println!("  pid:      {}", field("pid"));
    println!("  state:    {}", field("state"));
    println!("  backend:  {}", field("backend"));
    println!("  token:    {}", field("token"));
    println!("  entries:  {}", field("journal_entries"));
    println!("  started:  {}", field("started_at"));
}

pub fn run(
    path: Option<&Path>,
    config_file: Option<&Path>,
    log_file: Option<PathBuf>,
) -> Result<ExitCode> {
    let (root, config) = resolve_root(path, config_file)?;
    let endpoint = Endpoint::resolve(&root, &config)?;
    let reason = start_blocking(&endpoint.root, config, log_file)
        .with_context(|| format!("daemon for {} exited with error", endpoint.root.display()))?;
    eprintln!("daemon for {} stopped: {reason}", endpoint.root.display());
    Ok(ExitCode::SUCCESS)
}

//! Daemon configuration.
//!
//! # Resolution order
//!
//! ```text
//! defaults
//!   <- YAML file (--config <file>, else <root>/.git/fsmonitor.yaml when present)
//!   <- environment (FSMONITOR_*)
//! ```
//!
//! Every resolving function has two forms, mirroring the rest of the crate:
//! - `fn_with(…, env)`: explicit environment lookup; used in tests
//! - `fn(…)`: reads the process environment, delegates to `_with`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_METADATA_DIR: &str = ".git";
pub const CONFIG_FILE_NAME: &str = "fsmonitor.yaml";
pub const DEFAULT_JOURNAL_LIMIT: usize = 1_000_000;
pub const DEFAULT_START_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;

pub const ENV_DELAY_MS: &str = "FSMONITOR_DELAY_MS";
pub const ENV_TRACE: &str = "FSMONITOR_TRACE";
pub const ENV_DETERMINISTIC_TOKEN: &str = "FSMONITOR_DETERMINISTIC_TOKEN";
pub const ENV_SOCKET_DIR: &str = "FSMONITOR_SOCKET_DIR";
pub const ENV_BACKEND: &str = "FSMONITOR_BACKEND";
pub const ENV_IDLE_TIMEOUT_SECS: &str = "FSMONITOR_IDLE_TIMEOUT_SECS";

/// Which notification source the watcher subscribes through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The platform's native API (inotify, FSEvents, ReadDirectoryChangesW, kqueue).
    #[default]
    Native,
    /// Portable stat polling.
    Poll,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "poll" => Ok(Self::Poll),
            other => Err(format!("unknown backend '{other}'; expected: native, poll")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FsmonitorConfig {
    /// Settle wait applied before answering each query.
    pub delay_ms: u64,
    /// Upper bound for `delay_ms`.
    pub max_delay_ms: u64,
    /// File receiving one line per journaled path.
    pub trace_path: Option<PathBuf>,
    /// Use `test` as run id so token sequences are reproducible.
    ///
    /// Every run then starts at `:internal:test:0:0`, so a token kept from an
    /// earlier daemon matches the new epoch and gets a partial answer instead
    /// of a rescan. Tests only.
    pub deterministic_token: bool,
    /// Name of the repository metadata directory directly under the root.
    pub metadata_dir: String,
    /// Directory holding daemon sockets and logs.
    pub socket_dir: Option<PathBuf>,
    pub backend: BackendKind,
    /// Shut down after this long without a client request.
    pub idle_timeout_secs: Option<u64>,
    /// Distinct paths held before the journal starts a new epoch.
    pub journal_limit: usize,
    /// How long `start` waits for the readiness handshake.
    pub start_timeout_ms: u64,
}

impl Default for FsmonitorConfig {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            trace_path: None,
            deterministic_token: false,
            metadata_dir: DEFAULT_METADATA_DIR.to_string(),
            socket_dir: None,
            backend: BackendKind::Native,
            idle_timeout_secs: None,
            journal_limit: DEFAULT_JOURNAL_LIMIT,
            start_timeout_ms: DEFAULT_START_TIMEOUT_MS,
        }
    }
}

impl FsmonitorConfig {
    /// Parse one YAML config file. Missing fields keep their defaults.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `FSMONITOR_*` overrides from `env`.
    pub fn apply_env_with<F>(mut self, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = env(ENV_DELAY_MS) {
            self.delay_ms = parse_env(ENV_DELAY_MS, &value)?;
        }
        if let Some(value) = env(ENV_TRACE) {
            self.trace_path = (!value.is_empty()).then(|| PathBuf::from(value));
        }
        if let Some(value) = env(ENV_DETERMINISTIC_TOKEN) {
            self.deterministic_token = parse_flag(ENV_DETERMINISTIC_TOKEN, &value)?;
        }
        if let Some(value) = env(ENV_SOCKET_DIR) {
            self.socket_dir = (!value.is_empty()).then(|| PathBuf::from(value));
        }
        if let Some(value) = env(ENV_BACKEND) {
            self.backend = value.parse().map_err(|_| ConfigError::Env {
                var: ENV_BACKEND,
                value,
            })?;
        }
        if let Some(value) = env(ENV_IDLE_TIMEOUT_SECS) {
            self.idle_timeout_secs = match value.as_str() {
                "" | "0" => None,
                _ => Some(parse_env(ENV_IDLE_TIMEOUT_SECS, &value)?),
            };
        }
        Ok(self)
    }

    /// Reject values the daemon cannot run with; clamp `delay_ms`.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        let metadata = Path::new(&self.metadata_dir);
        let single_component = metadata.components().count() == 1
            && matches!(
                metadata.components().next(),
                Some(std::path::Component::Normal(_))
            );
        if !single_component {
            return Err(ConfigError::Invalid(format!(
                "metadata_dir '{}' must be a single directory name",
                self.metadata_dir
            )));
        }
        if self.journal_limit == 0 {
            return Err(ConfigError::Invalid(
                "journal_limit must be greater than zero".to_string(),
            ));
        }
        if self.start_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "start_timeout_ms must be greater than zero".to_string(),
            ));
        }
        self.delay_ms = self.delay_ms.min(self.max_delay_ms);
        Ok(self)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    /// `<root>/<metadata_dir>`
    pub fn metadata_path(&self, root: &Path) -> PathBuf {
        root.join(&self.metadata_dir)
    }

    /// Socket directory: configured, else the user runtime dir, else
    /// `<tmp>/fsmonitor`.
    pub fn resolved_socket_dir(&self) -> PathBuf {
        if let Some(dir) = &self.socket_dir {
            return dir.clone();
        }
        dirs::runtime_dir().unwrap_or_else(|| std::env::temp_dir().join("fsmonitor"))
    }
}

/// Resolve configuration for `root` using an explicit environment lookup.
///
/// `explicit` must exist when given; the per-repository file is optional.
///
/// The per-repository file is always `<root>/.git/fsmonitor.yaml`, whatever
/// `metadata_dir` it goes on to set: `metadata_dir` has no environment
/// override, so only a file can change it, and that file has to be found
/// first. Roots with another metadata directory pass their file with
/// `--config`.
pub fn resolve_with<F>(
    root: Option<&Path>,
    explicit: Option<&Path>,
    env: F,
) -> Result<FsmonitorConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let base = match (explicit, root) {
        (Some(path), _) => FsmonitorConfig::load_file(path)?,
        (None, Some(root)) => {
            let candidate = root.join(DEFAULT_METADATA_DIR).join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                FsmonitorConfig::load_file(&candidate)?
            } else {
                FsmonitorConfig::default()
            }
        }
        (None, None) => FsmonitorConfig::default(),
    };
    base.apply_env_with(env)?.validate()
}

/// [`resolve_with`] against the process environment.
pub fn resolve(root: Option<&Path>, explicit: Option<&Path>) -> Result<FsmonitorConfig, ConfigError> {
    resolve_with(root, explicit, |var| std::env::var(var).ok())
}

/// Walk up from `start` to the nearest directory containing `metadata_dir`.
pub fn discover_root(start: &Path, metadata_dir: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(metadata_dir).is_dir())
        .map(Path::to_path_buf)
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var,
        value: value.to_string(),
    })
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Env {
            var,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = FsmonitorConfig::default().validate().expect("valid");
        assert_eq!(config.metadata_dir, ".git");
        assert_eq!(config.delay(), Duration::ZERO);
        assert!(config.idle_timeout().is_none());
    }

    #[test]
    fn delay_is_clamped_to_max() {
        let config = FsmonitorConfig {
            delay_ms: 60_000,
            ..FsmonitorConfig::default()
        }
        .validate()
        .expect("valid");
        assert_eq!(config.delay_ms, DEFAULT_MAX_DELAY_MS);
    }

    #[test]
    fn nested_metadata_dir_is_rejected() {
        let err = FsmonitorConfig {
            metadata_dir: "a/b".to_string(),
            ..FsmonitorConfig::default()
        }
        .validate()
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "got: {err}");
    }

    #[test]
    fn parent_metadata_dir_is_rejected() {
        let err = FsmonitorConfig {
            metadata_dir: "..".to_string(),
            ..FsmonitorConfig::default()
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("single directory name"));
    }

    #[test]
    fn flag_parsing_accepts_common_spellings() {
        assert!(parse_flag(ENV_DETERMINISTIC_TOKEN, "TRUE").expect("flag"));
        assert!(!parse_flag(ENV_DETERMINISTIC_TOKEN, "0").expect("flag"));
        assert!(parse_flag(ENV_DETERMINISTIC_TOKEN, "maybe").is_err());
    }
}

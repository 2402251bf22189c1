//! Endpoint derivation and timing constants.
//!
//! Every watch root maps to exactly one socket:
//!
//! ```text
//! <socket_dir>/
//!   fsmonitor-<sha256(canonical root)[..16]>.sock
//!   fsmonitor-<sha256(canonical root)[..16]>.log
//! ```

use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};

use fsmonitor_core::FsmonitorConfig;

use crate::error::{io_err, DaemonError};

pub const ENDPOINT_PREFIX: &str = "fsmonitor-";
pub const ENDPOINT_KEY_LEN: usize = 16;

pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const STOP_WAIT: Duration = Duration::from_secs(5);
pub const ROOT_PROBE_INTERVAL: Duration = Duration::from_secs(1);
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub const LOG_ROTATION_INTERVAL: Duration = Duration::from_secs(5);
pub const CLIENT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Where one watch root's daemon listens and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub root: PathBuf,
    pub socket: PathBuf,
    pub log: PathBuf,
}

impl Endpoint {
    /// Derive the endpoint for an already canonical `root`.
    pub fn for_root(root: &Path, socket_dir: &Path) -> Self {
        let key = endpoint_key(root);
        Self {
            root: root.to_path_buf(),
            socket: socket_dir.join(format!("{ENDPOINT_PREFIX}{key}.sock")),
            log: socket_dir.join(format!("{ENDPOINT_PREFIX}{key}.log")),
        }
    }

    /// Canonicalize `root` and derive its endpoint from `config`.
    pub fn resolve(root: &Path, config: &FsmonitorConfig) -> Result<Self, DaemonError> {
        let root = canonical_root(root)?;
        Ok(Self::for_root(&root, &config.resolved_socket_dir()))
    }
}

/// First 16 hex chars of the SHA-256 of the root's bytes.
pub fn endpoint_key(root: &Path) -> String {
    let digest = Sha256::digest(root.as_os_str().as_bytes());
    let mut key = hex::encode(digest);
    key.truncate(ENDPOINT_KEY_LEN);
    key
}

pub fn canonical_root(root: &Path) -> Result<PathBuf, DaemonError> {
    fs::canonicalize(root).map_err(|e| io_err(root, e))
}

/// Create the socket directory (mode `0700`) if it does not exist.
pub fn ensure_socket_dir(dir: &Path) -> Result<(), DaemonError> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        set_dir_permissions(dir)?;
    }
    Ok(())
}

fn set_dir_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|e| io_err(path, e))
}

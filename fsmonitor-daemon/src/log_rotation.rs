//! Size-based rotation for the detached daemon's log file.
//!
//! The daemon reopens its log for every write (see `runtime::LogFile`), so
//! renaming the live file is safe: the next line lands in a fresh file.
//!
//! ```text
//! fsmonitor-<key>.log -> .log.1 -> .log.2 -> … -> .log.<max_files> (dropped)
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Rotate once the live log passes 10 MiB.
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Rotated copies kept next to the live log.
pub const MAX_ROTATED_FILES: usize = 5;

/// Rotate `log_path` when it is at least `max_bytes` long.
///
/// Returns `true` when a rotation happened. A missing log is not an error.
pub fn rotate_if_needed(log_path: &Path, max_bytes: u64, max_files: usize) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if size < max_bytes || max_files == 0 {
        return Ok(false);
    }

    match fs::remove_file(numbered_path(log_path, max_files)) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    for n in (1..max_files).rev() {
        let from = numbered_path(log_path, n);
        if from.exists() {
            fs::rename(&from, numbered_path(log_path, n + 1))?;
        }
    }
    fs::rename(log_path, numbered_path(log_path, 1))?;
    Ok(true)
}

/// Rotate the daemon log with the default limits, logging the outcome.
pub fn rotate_log(log_path: &Path) {
    match rotate_if_needed(log_path, MAX_LOG_BYTES, MAX_ROTATED_FILES) {
        Ok(true) => tracing::info!(path = %log_path.display(), "log file rotated"),
        Ok(false) => {}
        Err(err) => {
            tracing::warn!(path = %log_path.display(), error = %err, "log rotation failed")
        }
    }
}

/// `<log>.<n>`, e.g. `fsmonitor-0123abcd.log.2`.
fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_log(path: &Path, size: usize) {
        fs::write(path, vec![b'x'; size]).expect("write log");
    }

    #[test]
    fn small_log_is_left_alone() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("fsmonitor-abc.log");
        write_log(&log, 1024);
        assert!(!rotate_if_needed(&log, 4096, 3).expect("rotate"));
        assert!(!numbered_path(&log, 1).exists());
    }

    #[test]
    fn oversized_log_moves_to_dot_one() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("fsmonitor-abc.log");
        write_log(&log, 4096);

        assert!(rotate_if_needed(&log, 4096, 3).expect("rotate"));
        assert!(!log.exists(), "the writer recreates the live log on demand");
        assert_eq!(fs::metadata(numbered_path(&log, 1)).expect("meta").len(), 4096);
    }

    #[test]
    fn rotated_copies_are_capped() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("fsmonitor-abc.log");
        for round in 0..5u8 {
            fs::write(&log, vec![b'0' + round; 4096]).expect("write");
            rotate_if_needed(&log, 4096, 3).expect("rotate");
        }

        assert!(numbered_path(&log, 3).exists());
        assert!(!numbered_path(&log, 4).exists());
        let newest = fs::read(numbered_path(&log, 1)).expect("read");
        assert_eq!(newest[0], b'4', ".1 holds the most recent rotation");
    }

    #[test]
    fn missing_log_is_not_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("never-written.log");
        assert!(!rotate_if_needed(&log, 1, 3).expect("rotate"));
    }

    #[test]
    fn numbered_path_appends_suffix() {
        let path = numbered_path(Path::new("/run/fsmonitor-abc.log"), 2);
        assert_eq!(path, PathBuf::from("/run/fsmonitor-abc.log.2"));
    }
}

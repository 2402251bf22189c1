//! Watch-root subscription and event normalization.
//!
//! ```text
//! OS backend (notify) -> unbounded channel -> watcher_task
//!   -> Normalizer::classify -> DaemonState::record / flush / request_shutdown
//! ```
//!
//! The backend callback never blocks: it only forwards into the channel, so
//! slow clients or a busy journal cannot stall the OS notification thread.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{SecondsFormat, Utc};
use notify::event::{EventKind, ModifyKind};
use notify::{Event, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use fsmonitor_core::BackendKind;

use crate::error::{io_err, DaemonError};
use crate::paths::ROOT_PROBE_INTERVAL;
use crate::state::{DaemonState, FlushReason, ShutdownReason};

pub type RawEvent = notify::Result<Event>;

/// True when this platform has a native notification backend.
pub const fn is_supported() -> bool {
    cfg!(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly",
    ))
}

/// Live OS subscription. Dropping it releases every watch.
pub struct WatchHandle {
    kind: BackendKind,
    _watcher: Box<dyn Watcher + Send>,
}

impl WatchHandle {
    pub fn kind(&self) -> BackendKind {
        self.kind
    }
}

/// Subscribe recursively under `root`, forwarding raw events into `tx`.
pub fn subscribe(
    kind: BackendKind,
    root: &Path,
    tx: mpsc::UnboundedSender<RawEvent>,
) -> Result<WatchHandle, DaemonError> {
    let handler = move |event: RawEvent| {
        let _ = tx.send(event);
    };
    let mut watcher: Box<dyn Watcher + Send> = match kind {
        BackendKind::Native => Box::new(RecommendedWatcher::new(
            handler,
            notify::Config::default(),
        )?),
        BackendKind::Poll => Box::new(PollWatcher::new(
            handler,
            notify::Config::default().with_poll_interval(std::time::Duration::from_millis(250)),
        )?),
    };
    watcher.watch(root, RecursiveMode::Recursive)?;
    tracing::info!(root = %root.display(), backend = ?kind, "watching root");
    Ok(WatchHandle {
        kind,
        _watcher: watcher,
    })
}

/// `(device, inode)` of the root and its metadata directory, captured at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootIdentity {
    root: PathBuf,
    metadata: PathBuf,
    root_id: (u64, u64),
    metadata_id: (u64, u64),
}

impl RootIdentity {
    pub fn capture(root: &Path, metadata: &Path) -> Result<Self, DaemonError> {
        let metadata_id = match dir_identity(metadata) {
            Ok(Some(id)) => id,
            Ok(None) => {
                return Err(DaemonError::MetadataMissing {
                    root: root.to_path_buf(),
                    metadata: metadata.to_path_buf(),
                })
            }
            Err(err) => return Err(io_err(metadata, err)),
        };
        let root_id = dir_identity(root)
            .map_err(|e| io_err(root, e))?
            .ok_or_else(|| io_err(root, std::io::Error::from(ErrorKind::NotFound)))?;
        Ok(Self {
            root: root.to_path_buf(),
            metadata: metadata.to_path_buf(),
            root_id,
            metadata_id,
        })
    }

    /// Both directories still exist and are the same inodes as at start.
    pub fn is_intact(&self) -> bool {
        matches!(dir_identity(&self.root), Ok(Some(id)) if id == self.root_id)
            && matches!(dir_identity(&self.metadata), Ok(Some(id)) if id == self.metadata_id)
    }
}

fn dir_identity(path: &Path) -> std::io::Result<Option<(u64, u64)>> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(Some((meta.dev(), meta.ino()))),
        Ok(_) => Ok(None),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// One raw event, reduced to what the journal and lifecycle care about.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Classified {
    /// Root-relative, `/`-separated, metadata directory excluded.
    pub paths: Vec<String>,
    /// History has a gap: the backend dropped events, or a changed name
    /// below the root could not be reported.
    pub overflow: bool,
    /// The event names the root or the metadata directory itself.
    pub touches_root: bool,
}

enum Located {
    Path(String),
    /// Outside the root, the root itself, or metadata.
    Ignored,
    /// A changed name right below the root that has no UTF-8 form.
    Unrepresentable,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    root: PathBuf,
    metadata: PathBuf,
}

impl Normalizer {
    pub fn new(root: &Path, metadata_dir: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            metadata: root.join(metadata_dir),
        }
    }

    /// Root-relative form of `path`, or `None` for the root itself, anything
    /// outside it, anything inside the metadata directory, and names that
    /// cannot be written as UTF-8 right below the root.
    pub fn relative(&self, path: &Path) -> Option<String> {
        match self.locate(path) {
            Located::Path(relative) => Some(relative),
            Located::Ignored | Located::Unrepresentable => None,
        }
    }

    /// A component that is not valid UTF-8 is cut off together with
    /// everything below it, so the nearest expressible ancestor is reported
    /// instead of a lossy name that does not exist on disk.
    fn locate(&self, path: &Path) -> Located {
        if path.starts_with(&self.metadata) {
            return Located::Ignored;
        }
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return Located::Ignored;
        };

        let mut parts: Vec<&str> = Vec::new();
        for component in relative.components() {
            let Component::Normal(part) = component else {
                continue;
            };
            match part.to_str() {
                Some(part) => parts.push(part),
                None if parts.is_empty() => return Located::Unrepresentable,
                None => break,
            }
        }
        if parts.is_empty() {
            return Located::Ignored;
        }
        Located::Path(parts.join("/"))
    }

    pub fn classify(&self, event: &Event) -> Classified {
        let mut classified = Classified {
            overflow: event.need_rescan(),
            ..Classified::default()
        };
        if matches!(event.kind, EventKind::Access(_)) {
            return classified;
        }

        // Rename pairs arrive as one event with both paths; each is
        // reported on its own.
        for path in &event.paths {
            if path == &self.root || path == &self.metadata {
                classified.touches_root = true;
                continue;
            }
            match self.locate(path) {
                Located::Path(relative) => classified.paths.push(relative),
                Located::Unrepresentable => classified.overflow = true,
                Located::Ignored => continue,
            }

            if is_creation(&event.kind) && path.is_dir() {
                for child in collect_entries(path) {
                    if let Located::Path(relative) = self.locate(&child) {
                        classified.paths.push(relative);
                    }
                }
            }
        }
        classified.paths.dedup();
        classified
    }
}

fn is_creation(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
    )
}

/// Every entry below `dir`, breadth first. Vanished entries are skipped.
fn collect_entries(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                pending.push(path.clone());
            }
            found.push(path);
        }
    }
    found
}

/// Diagnostic sink: one `<rfc3339> <path>` line per journaled path.
pub struct TraceSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl TraceSink {
    pub fn open(path: &Path) -> Result<Self, DaemonError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| io_err(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn record(&self, paths: &[String]) {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut buf = String::new();
        for path in paths {
            buf.push_str(&now);
            buf.push(' ');
            buf.push_str(path);
            buf.push('\n');
        }
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = file.write_all(buf.as_bytes()) {
            tracing::warn!(path = %self.path.display(), error = %err, "trace write failed");
        }
    }
}

/// Drain backend events into the journal until shutdown, backend loss, or
/// loss of the root's metadata directory.
pub(crate) async fn watcher_task(
    state: Arc<DaemonState>,
    mut events: mpsc::UnboundedReceiver<RawEvent>,
    identity: RootIdentity,
    handle: Option<WatchHandle>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let normalizer = Normalizer::new(&state.endpoint.root, &state.config.metadata_dir);
    let mut probe = tokio::time::interval(ROOT_PROBE_INTERVAL);
    probe.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = probe.tick() => {
                if !identity_intact(&identity).await {
                    tracing::warn!(root = %state.endpoint.root.display(), "root probe failed");
                    state.request_shutdown(ShutdownReason::RootLost);
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::warn!("watch backend channel closed");
                    break;
                };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watch backend error");
                        state.flush(FlushReason::BackendError).await;
                        continue;
                    }
                };

                let classified = classify_event(&normalizer, &event).await;
                if classified.touches_root && !identity_intact(&identity).await {
                    tracing::warn!(
                        root = %state.endpoint.root.display(),
                        kind = ?event.kind,
                        "metadata directory lost",
                    );
                    state.request_shutdown(ShutdownReason::RootLost);
                    break;
                }
                if classified.overflow {
                    state.flush(FlushReason::Overflow).await;
                }
                state.record(classified.paths).await;
            }
        }
    }

    if let Some(handle) = handle {
        tracing::debug!(backend = ?handle.kind(), "releasing watches");
        drop(handle);
    }
    Ok(())
}

/// Creation events may walk a whole new subtree; keep that off the runtime.
async fn classify_event(normalizer: &Normalizer, event: &Event) -> Classified {
    if !is_creation(&event.kind) {
        return normalizer.classify(event);
    }
    let normalizer = normalizer.clone();
    let event = event.clone();
    tokio::task::spawn_blocking(move || normalizer.classify(&event))
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "event classification failed");
            Classified {
                overflow: true,
                ..Classified::default()
            }
        })
}

async fn identity_intact(identity: &RootIdentity) -> bool {
    let identity = identity.clone();
    tokio::task::spawn_blocking(move || identity.is_intact())
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "root identity check failed");
            true
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, Flag, RemoveKind, RenameMode};

    fn normalizer() -> Normalizer {
        Normalizer::new(Path::new("/work/repo"), ".git")
    }

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |event, path| event.add_path(PathBuf::from(path)))
    }

    #[test]
    fn relative_paths_use_forward_slashes() {
        let n = normalizer();
        assert_eq!(
            n.relative(Path::new("/work/repo/src/lib.rs")).as_deref(),
            Some("src/lib.rs")
        );
        assert_eq!(n.relative(Path::new("/work/repo")), None);
        assert_eq!(n.relative(Path::new("/elsewhere/file")), None);
    }

    #[test]
    fn metadata_contents_are_not_journaled() {
        let n = normalizer();
        assert_eq!(n.relative(Path::new("/work/repo/.git/index")), None);
        assert_eq!(
            n.relative(Path::new("/work/repo/.github/workflow.yml")).as_deref(),
            Some(".github/workflow.yml")
        );
    }

    #[test]
    fn rename_reports_both_paths() {
        let classified = normalizer().classify(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/work/repo/old.txt", "/work/repo/new.txt"],
        ));
        assert_eq!(classified.paths, vec!["old.txt", "new.txt"]);
        assert!(!classified.touches_root);
    }

    #[test]
    fn access_events_are_ignored() {
        let classified = normalizer().classify(&event(
            EventKind::Access(notify::event::AccessKind::Any),
            &["/work/repo/read.txt"],
        ));
        assert!(classified.paths.is_empty());
    }

    #[test]
    fn rescan_flag_marks_overflow() {
        let overflow = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        let classified = normalizer().classify(&overflow);
        assert!(classified.overflow);
        assert!(classified.paths.is_empty());
    }

    #[test]
    fn removing_metadata_dir_touches_root() {
        let classified = normalizer().classify(&event(
            EventKind::Remove(RemoveKind::Folder),
            &["/work/repo/.git"],
        ));
        assert!(classified.touches_root);
        assert!(classified.paths.is_empty());
    }

    #[test]
    fn created_directory_reports_children() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let root = fs::canonicalize(dir.path()).expect("canonicalize");
        fs::create_dir_all(root.join("new/inner")).expect("mkdir");
        fs::write(root.join("new/inner/file.txt"), b"x").expect("write");

        let n = Normalizer::new(&root, ".git");
        let created = Event::new(EventKind::Create(CreateKind::Folder))
            .add_path(root.join("new"));
        let mut paths = n.classify(&created).paths;
        paths.sort();
        assert_eq!(paths, vec!["new", "new/inner", "new/inner/file.txt"]);
    }

    #[test]
    fn identity_detects_replacement() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let root = dir.path().to_path_buf();
        let metadata = root.join(".git");
        fs::create_dir(&metadata).expect("mkdir");

        let identity = RootIdentity::capture(&root, &metadata).expect("capture");
        assert!(identity.is_intact());

        fs::rename(&metadata, root.join(".git-old")).expect("rename");
        fs::create_dir(&metadata).expect("recreate");
        assert!(!identity.is_intact(), "a new inode is a different metadata dir");
    }

    #[test]
    fn capture_requires_metadata_dir() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let err = RootIdentity::capture(dir.path(), &dir.path().join(".git")).unwrap_err();
        assert!(matches!(err, DaemonError::MetadataMissing { .. }), "got: {err}");
    }

    #[test]
    fn trace_sink_appends_one_line_per_path() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("trace.log");
        let sink = TraceSink::open(&path).expect("open");
        sink.record(&["a.txt".to_string(), "dir/b.txt".to_string()]);
        sink.record(&["c.txt".to_string()]);

        let content = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with(" dir/b.txt"));
    }

    #[test]
    fn non_utf8_name_reports_nearest_ancestor() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let n = normalizer();
        let nested = Path::new("/work/repo/docs")
            .join(OsStr::from_bytes(b"caf\xe9"))
            .join("menu.txt");
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(nested);
        let classified = n.classify(&created);
        assert_eq!(classified.paths, vec!["docs"]);
        assert!(!classified.overflow);
    }

    #[test]
    fn non_utf8_name_below_root_forces_flush() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let n = normalizer();
        let top = Path::new("/work/repo").join(OsStr::from_bytes(b"caf\xe9.txt"));
        assert_eq!(n.relative(&top), None);

        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(top);
        let classified = n.classify(&created);
        assert!(classified.paths.is_empty());
        assert!(classified.overflow, "an unreportable change must invalidate history");
    }

    #[tokio::test]
    async fn creation_is_classified_off_the_runtime() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let root = fs::canonicalize(dir.path()).expect("canonicalize");
        fs::create_dir_all(root.join("tree/leaf")).expect("mkdir");

        let n = Normalizer::new(&root, ".git");
        let created =
            Event::new(EventKind::Create(CreateKind::Folder)).add_path(root.join("tree"));
        let mut paths = classify_event(&n, &created).await.paths;
        paths.sort();
        assert_eq!(paths, vec!["tree", "tree/leaf"]);

        let identity = RootIdentity::capture(&root, &root.join("tree")).expect("capture");
        assert!(identity_intact(&identity).await);
        fs::remove_dir_all(root.join("tree")).expect("rm tree");
        assert!(!identity_intact(&identity).await);
    }
}

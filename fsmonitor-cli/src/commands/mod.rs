pub mod daemon;
pub mod query;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use fsmonitor_core::config::{self, discover_root};
use fsmonitor_core::FsmonitorConfig;

/// Resolve the watch root and its configuration.
///
/// An explicit path wins; otherwise the nearest ancestor of the working
/// directory that holds the metadata directory.
pub fn resolve_root(
    explicit: Option<&Path>,
    config_file: Option<&Path>,
) -> Result<(PathBuf, FsmonitorConfig)> {
    let root = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let base = config::resolve(None, config_file).context("failed to load configuration")?;
            let cwd = std::env::current_dir().context("could not determine working directory")?;
            discover_root(&cwd, &base.metadata_dir).with_context(|| {
                format!(
                    "no '{}' directory found in {} or any parent",
                    base.metadata_dir,
                    cwd.display()
                )
            })?
        }
    };
    let config =
        config::resolve(Some(&root), config_file).context("failed to load configuration")?;
    Ok((root, config))
}

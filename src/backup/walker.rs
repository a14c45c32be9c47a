// pgbasebackup-s3/src/backup/walker.rs
use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::Sender;
use tracing::debug;
use walkdir::WalkDir;

/// Set of data-directory-relative prefixes that are never backed up.
///
/// Matching is per path component, so `pg_log` excludes `pg_log/postgresql.log`
/// but not `pg_logical/`.
#[derive(Debug, Clone, Default)]
pub struct IgnoreFilter {
    prefixes: Vec<PathBuf>,
}

impl IgnoreFilter {
    pub fn new(prefixes: Vec<PathBuf>) -> Self {
        Self { prefixes }
    }

    pub fn is_ignored(&self, relative: &Path) -> bool {
        self.prefixes.iter().any(|prefix| relative.starts_with(prefix))
    }
}

/// Walks `root` and hands every eligible path, relative to `root`, to `files_tx`.
///
/// Runs on a blocking thread. Blocks on each send until a worker is free.
/// Entries that vanish mid-walk are skipped; any other error (including a
/// missing root) stops the walk.
/// `files_tx` is consumed, so the channel closes whichever way this returns.
/// Returns the number of paths handed off.
pub fn walk_data_directory(root: &Path, filter: &IgnoreFilter, files_tx: Sender<PathBuf>) -> Result<usize> {
    debug!(root = %root.display(), "Walking data directory");
    let mut items = 0;

    let walker = WalkDir::new(root).min_depth(1).into_iter().filter_entry(|entry| {
        match entry.path().strip_prefix(root) {
            Ok(relative) => !filter.is_ignored(relative),
            Err(_) => true,
        }
    });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() > 0 && e.io_error().map(|io| io.kind()) == Some(ErrorKind::NotFound) => {
                // Expected while the server is running: the file was removed after it was listed.
                debug!(path = ?e.path(), "Entry vanished during walk, skipping");
                continue;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to walk data directory {}", root.display()));
            }
        };

        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| {
                format!(
                    "Failed to strip prefix {} from {}",
                    root.display(),
                    entry.path().display()
                )
            })?
            .to_path_buf();

        debug!(path = %relative.display(), "Adding path");
        if files_tx.blocking_send(relative).is_err() {
            // Every worker is gone; the pipeline is being torn down.
            debug!("Upload workers stopped, ending walk early");
            break;
        }
        items += 1;
    }

    Ok(items)
}

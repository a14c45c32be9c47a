// pgbasebackup-s3/src/backup/pipeline.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, Receiver};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::compress::{COMPRESSED_SUFFIX, compress_to_temp};
use super::walker::{IgnoreFilter, walk_data_directory};
use crate::config::BackupConfig;
use crate::errors::AppError;
use crate::storage::ObjectStore;

/// What a walked path turns into, decided once from a fresh stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupEntry {
    /// Empty placeholder object; keeps empty directories on restore.
    Directory,
    PlainFile { size: u64, mtime: i64 },
    CompressedFile { size: u64, mtime: i64 },
}

impl BackupEntry {
    /// Returns `None` for entries that are neither files nor directories (sockets, fifos).
    pub fn classify(metadata: &Metadata, compress_threshold: u64) -> Option<Self> {
        if metadata.is_dir() {
            return Some(BackupEntry::Directory);
        }
        if !metadata.is_file() {
            return None;
        }

        let size = metadata.len();
        let mtime = metadata
            .modified()
            .map(|t| DateTime::<Utc>::from(t).timestamp())
            .unwrap_or(0);
        if size > compress_threshold {
            Some(BackupEntry::CompressedFile { size, mtime })
        } else {
            Some(BackupEntry::PlainFile { size, mtime })
        }
    }

    pub fn object_key(&self, backup_name: &str, relative: &Path) -> String {
        let base = format!("{}/{}", backup_name, relative_key(relative));
        match self {
            BackupEntry::Directory => base + "/",
            BackupEntry::PlainFile { .. } => base,
            BackupEntry::CompressedFile { .. } => base + COMPRESSED_SUFFIX,
        }
    }
}

/// Joins path components with `/` regardless of the host separator.
fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Counters gathered by the upload phase. Informational only.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub walked: usize,
    pub files: usize,
    pub compressed: usize,
    pub directories: usize,
    /// Files left out because compression failed.
    pub skipped: usize,
    /// Paths gone by the time a worker got to them.
    pub vanished: usize,
    pub bytes: u64,
}

impl UploadReport {
    fn merge(&mut self, other: &UploadReport) {
        self.files += other.files;
        self.compressed += other.compressed;
        self.directories += other.directories;
        self.skipped += other.skipped;
        self.vanished += other.vanished;
        self.bytes += other.bytes;
    }
}

/// State shared by every upload worker.
struct WorkerContext {
    store: Arc<dyn ObjectStore>,
    backup_name: String,
    data_directory: PathBuf,
    tmp_directory: PathBuf,
    compress_threshold: u64,
}

impl WorkerContext {
    /// Uploads a single walked path. Errors returned here are fatal for the backup.
    async fn process(&self, relative: &Path, report: &mut UploadReport) -> Result<()> {
        let path = self.data_directory.join(relative);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                // Legitimate while taking an online backup: the server removed the file.
                info!(path = %relative.display(), error = %e, "Failed to stat file, it might have been removed");
                report.vanished += 1;
                return Ok(());
            }
        };

        let Some(entry) = BackupEntry::classify(&metadata, self.compress_threshold) else {
            debug!(path = %relative.display(), "Ignoring special file");
            return Ok(());
        };
        let key = entry.object_key(&self.backup_name, relative);

        match entry {
            BackupEntry::Directory => {
                self.store
                    .put_string(&key, "")
                    .await
                    .with_context(|| format!("Failed to create directory placeholder {}", key))?;
                report.directories += 1;
            }
            BackupEntry::PlainFile { size, mtime } => {
                if !self.upload(&key, &path, mtime, report).await? {
                    return Ok(());
                }
                report.files += 1;
                report.bytes += size;
            }
            BackupEntry::CompressedFile { size, mtime } => {
                debug!(path = %relative.display(), size, "Compressing file");
                let Some(compressed) = self.compress(&path, relative, report).await? else {
                    return Ok(());
                };

                // `compressed` removes the temporary file when it goes out of scope.
                if !self.upload(&key, &compressed, mtime, report).await? {
                    return Ok(());
                }
                report.files += 1;
                report.compressed += 1;
                report.bytes += size;
            }
        }

        Ok(())
    }

    /// Compresses `path` into the temporary directory. `Ok(None)` means the file
    /// was counted as vanished or skipped instead.
    async fn compress(&self, path: &Path, relative: &Path, report: &mut UploadReport) -> Result<Option<TempPath>> {
        let input = match tokio::fs::File::open(path).await {
            Ok(input) => input.into_std().await,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %relative.display(), "File removed before it could be compressed");
                report.vanished += 1;
                return Ok(None);
            }
            Err(e) => {
                warn!(path = %relative.display(), error = %e, "Failed to open file for compression, skipping it");
                report.skipped += 1;
                return Ok(None);
            }
        };

        let tmp_directory = self.tmp_directory.clone();
        let compressed = tokio::task::spawn_blocking(move || compress_to_temp(input, &tmp_directory))
            .await
            .context("Compression task panicked")?;
        match compressed {
            Ok(compressed) => Ok(Some(compressed)),
            Err(e) => {
                warn!(path = %relative.display(), error = %format!("{:#}", e), "Failed to compress file, skipping it");
                report.skipped += 1;
                Ok(None)
            }
        }
    }

    /// Returns `Ok(false)` when the source vanished before it could be read.
    async fn upload(&self, key: &str, source: &Path, mtime: i64, report: &mut UploadReport) -> Result<bool> {
        debug!(key, source = %source.display(), "Uploading file");
        match self.store.put(key, source, mtime).await {
            Ok(()) => Ok(true),
            Err(AppError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                info!(key, "File removed before it could be uploaded");
                report.vanished += 1;
                Ok(false)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to upload {}", key)),
        }
    }
}

/// Moves the data directory into the object store with a fixed pool of workers
/// fed by a single walker.
pub struct UploadPipeline {
    context: Arc<WorkerContext>,
    filter: IgnoreFilter,
    workers: usize,
}

impl UploadPipeline {
    pub fn new(store: Arc<dyn ObjectStore>, backup_name: &str, backup_config: &BackupConfig) -> Self {
        Self {
            context: Arc::new(WorkerContext {
                store,
                backup_name: backup_name.to_string(),
                data_directory: backup_config.data_directory.clone(),
                tmp_directory: backup_config.tmp_directory.clone(),
                compress_threshold: backup_config.compress_threshold,
            }),
            filter: IgnoreFilter::new(backup_config.ignore_prefixes.clone()),
            workers: backup_config.workers.max(1),
        }
    }

    /// Runs until the walk is exhausted and every worker has returned.
    ///
    /// The first fatal worker error aborts the remaining workers, which in turn
    /// stops the walker, and is returned.
    pub async fn run(&self) -> Result<UploadReport> {
        // Capacity 1 keeps the walker at most one path ahead of the workers.
        let (files_tx, files_rx) = mpsc::channel::<PathBuf>(1);
        let files_rx = Arc::new(Mutex::new(files_rx));

        info!(number = self.workers, "Spawning workers");
        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            workers.spawn(backup_worker(id, self.context.clone(), files_rx.clone()));
        }
        // Only workers may keep the receiver alive.
        drop(files_rx);

        let root = self.context.data_directory.clone();
        let filter = self.filter.clone();
        let walker = tokio::task::spawn_blocking(move || walk_data_directory(&root, &filter, files_tx));

        let mut report = UploadReport::default();
        while let Some(joined) = workers.join_next().await {
            let outcome = joined.context("Upload worker panicked").and_then(|r| r);
            match outcome {
                Ok(worker_report) => report.merge(&worker_report),
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "Upload failed, stopping all workers");
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    // With every receiver dropped the walker's next send fails and it returns.
                    let _ = walker.await;
                    return Err(e);
                }
            }
        }

        info!("All workers finished");
        report.walked = walker
            .await
            .context("Walker task panicked")?
            .context("Failed to walk data directory")?;
        Ok(report)
    }
}

async fn backup_worker(
    id: usize,
    context: Arc<WorkerContext>,
    files_rx: Arc<Mutex<Receiver<PathBuf>>>,
) -> Result<UploadReport> {
    let mut report = UploadReport::default();
    loop {
        let next = files_rx.lock().await.recv().await;
        let Some(relative) = next else {
            debug!(worker = id, "No more files to process");
            return Ok(report);
        };
        context.process(&relative, &mut report).await?;
    }
}

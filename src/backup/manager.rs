// pgbasebackup-s3/src/backup/manager.rs
use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

use super::pipeline::{UploadPipeline, UploadReport};
use super::session::{BackupSession, SessionArtifacts};
use crate::config::BackupConfig;
use crate::errors::AppError;
use crate::storage::ObjectStore;

/// Namespace holding one zero-byte marker per fully completed backup.
pub const SUCCESSFUL_PREFIX: &str = "successful";
/// Object whose payload names the most recent successful backup.
pub const LATEST_KEY: &str = "LATEST";

/// Where a backup got to. Anything short of `LatestUpdated` is incomplete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Pending,
    SessionOpen,
    Uploading,
    SessionClosed,
    MarkedSuccessful,
    LatestUpdated,
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupState::Pending => "pending",
            BackupState::SessionOpen => "session_open",
            BackupState::Uploading => "uploading",
            BackupState::SessionClosed => "session_closed",
            BackupState::MarkedSuccessful => "marked_successful",
            BackupState::LatestUpdated => "latest_updated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub name: String,
    pub upload: UploadReport,
    pub duration: Duration,
}

pub fn successful_marker_key(name: &str) -> String {
    format!("{}/{}", SUCCESSFUL_PREFIX, name)
}

fn validate_name(name: &str) -> Result<(), AppError> {
    if name.is_empty() || name.contains('/') || name == SUCCESSFUL_PREFIX {
        return Err(AppError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Reads the latest pointer. `None` until a backup has completed.
pub async fn latest_backup(store: &dyn ObjectStore) -> Result<Option<String>> {
    match store.get_string(LATEST_KEY).await {
        Ok(name) => Ok(Some(name)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e).context("Failed to read the LATEST marker"),
    }
}

/// Sequences a backup so that the success marker and latest pointer only
/// ever refer to a backup whose every object was written.
pub struct BackupManager {
    store: Arc<dyn ObjectStore>,
    session: Box<dyn BackupSession>,
    backup_config: BackupConfig,
}

impl BackupManager {
    pub fn new(store: Arc<dyn ObjectStore>, session: Box<dyn BackupSession>, backup_config: BackupConfig) -> Self {
        Self {
            store,
            session,
            backup_config,
        }
    }

    pub async fn create_backup(&self, name: &str) -> Result<BackupReport> {
        validate_name(name)?;
        info!(name, "Starting backup");
        let begin = Instant::now();

        // Never overwrite an existing backup.
        let top_level = format!("{}/", name);
        if self
            .store
            .exists(&top_level)
            .await
            .context("Failed to check for an existing backup")?
        {
            return Err(AppError::NameTaken(name.to_string()).into());
        }

        // Create the top-level "folder" first so the name is reserved.
        self.store
            .put_string(&top_level, "")
            .await
            .context("Failed to create top-level backup folder")?;

        let mut state = BackupState::Pending;
        let outcome = self.run_phases(name, &mut state).await;
        let upload = match outcome {
            Ok(upload) => upload,
            Err(e) => {
                error!(name, state = %state, error = %format!("{:#}", e), "Backup failed, it is left incomplete");
                return Err(e);
            }
        };

        let report = BackupReport {
            name: name.to_string(),
            upload,
            duration: begin.elapsed(),
        };
        info!(
            name,
            files = report.upload.files,
            directories = report.upload.directories,
            compressed = report.upload.compressed,
            skipped = report.upload.skipped,
            vanished = report.upload.vanished,
            bytes = report.upload.bytes,
            seconds = report.duration.as_secs_f64(),
            "Backup successfully completed"
        );
        Ok(report)
    }

    async fn run_phases(&self, name: &str, state: &mut BackupState) -> Result<UploadReport> {
        // Tell the server we're starting a base backup, copy all the files, tell it we're done.
        let handle = self
            .session
            .begin(name, self.backup_config.fast_checkpoint)
            .await
            .context("Failed to start backup")?;
        advance(name, state, BackupState::SessionOpen);

        advance(name, state, BackupState::Uploading);
        let upload = UploadPipeline::new(self.store.clone(), name, &self.backup_config)
            .run()
            .await
            .context("Failed to upload the data directory")?;
        info!(name, files = upload.files, walked = upload.walked, "Data directory uploaded");

        let artifacts = handle.end().await.context("Failed to stop backup")?;
        advance(name, state, BackupState::SessionClosed);
        if let Some(artifacts) = artifacts {
            self.upload_artifacts(name, &artifacts).await?;
        }

        self.store
            .put_string(&successful_marker_key(name), "")
            .await
            .context("Failed to mark backup as successfully completed")?;
        advance(name, state, BackupState::MarkedSuccessful);

        self.store
            .put_string(LATEST_KEY, name)
            .await
            .context("Failed to update the LATEST marker")?;
        advance(name, state, BackupState::LatestUpdated);

        Ok(upload)
    }

    async fn upload_artifacts(&self, name: &str, artifacts: &SessionArtifacts) -> Result<()> {
        self.store
            .put_string(&format!("{}/backup_label", name), &artifacts.backup_label)
            .await
            .context("Failed to upload backup_label")?;

        if let Some(map) = artifacts.tablespace_map.as_deref().filter(|m| !m.is_empty()) {
            self.store
                .put_string(&format!("{}/tablespace_map", name), map)
                .await
                .context("Failed to upload tablespace_map")?;
        }
        Ok(())
    }
}

fn advance(name: &str, state: &mut BackupState, next: BackupState) {
    info!(name, from = %state, to = %next, "Backup state changed");
    *state = next;
}

pub(crate) mod compress; // Per-file gzip into a temporary file
pub(crate) mod manager; // Phase ordering, markers and the LATEST pointer
pub(crate) mod pipeline; // Walker-fed upload worker pool
pub(crate) mod session; // Start/stop backup protocol with the server
pub(crate) mod walker; // Data directory enumeration and ignore filter

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{AppConfig, BackupOverrides, load_backup_config, load_database_config};
use crate::storage;
use manager::{BackupManager, BackupReport};
use session::PgBackupSession;

/// Public entry point for the create-backup operation.
pub async fn run_backup_flow(app_config: &AppConfig, name: &str, overrides: &BackupOverrides) -> Result<BackupReport> {
    let backup_config = load_backup_config(&app_config.raw_json_config, overrides)
        .context("Failed to load backup configuration")?;
    let database_config = load_database_config(&app_config.raw_json_config, overrides);
    info!(
        data_directory = %backup_config.data_directory.display(),
        workers = backup_config.workers,
        compress_threshold = backup_config.compress_threshold,
        mode = ?backup_config.session_mode,
        "Backup configuration loaded"
    );

    let store = storage::open_store(app_config).await?;
    let session = PgBackupSession::new(
        database_config.connect_options()?,
        backup_config.session_mode,
        backup_config.statement_timeout,
    );

    BackupManager::new(store, Box::new(session), backup_config)
        .create_backup(name)
        .await
}

/// Returns the name the LATEST pointer refers to, if any backup has completed.
pub async fn run_latest_flow(app_config: &AppConfig) -> Result<Option<String>> {
    let store = storage::open_store(app_config).await?;
    manager::latest_backup(store.as_ref()).await
}

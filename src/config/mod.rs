// pgbasebackup-s3/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_COMPRESS_THRESHOLD: u64 = 512 * 1024;
pub const DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_PG_USER: &str = "postgres";

/// Paths under the data directory that are never useful in a restored copy.
pub const DEFAULT_IGNORE_PREFIXES: &[&str] = &[
    "pg_wal",
    "pg_xlog",
    "pg_replslot",
    "postmaster.pid",
    "postmaster.opts",
    "pg_log",
    "log",
];

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
    pub force_path_style: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonDatabaseConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: Option<String>,
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonBackupOptions {
    pub data_directory: Option<PathBuf>,
    pub tmp_directory: Option<PathBuf>,
    pub compress_threshold: Option<u64>,
    pub workers: Option<usize>,
    pub statement_timeout_secs: Option<u64>,
    pub fast_checkpoint: Option<bool>,
    pub session_mode: Option<SessionMode>,
    pub ignore_prefixes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub local_storage_dir: Option<PathBuf>,
    pub database: Option<JsonDatabaseConfig>,
    pub backup: Option<JsonBackupOptions>,
}

/// How the backup window is opened on the server. The two modes capture
/// `backup_label`/`tablespace_map` differently, so the choice is explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Dedicated connection held for the whole backup; artifacts are returned by the stop call.
    #[default]
    NonExclusive,
    /// Server writes artifacts into the data directory. Not available on PostgreSQL 15+.
    Exclusive,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
    pub force_path_style: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: String,
    pub password: Option<String>,
    pub ssl_mode: Option<String>,
    pub database: Option<String>,
}

impl DatabaseConfig {
    /// Connection options for the backup session. Anything not set here falls
    /// back to the usual `PG*` environment variables.
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        let mut options = PgConnectOptions::new().username(&self.user);
        if let Some(host) = &self.host {
            options = options.host(host);
        }
        if let Some(port) = self.port {
            options = options.port(port);
        }
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        if let Some(database) = &self.database {
            options = options.database(database);
        }
        if let Some(ssl_mode) = &self.ssl_mode {
            let mode = PgSslMode::from_str(ssl_mode)
                .with_context(|| format!("Invalid ssl_mode '{}'", ssl_mode))?;
            options = options.ssl_mode(mode);
        }
        Ok(options)
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub data_directory: PathBuf,
    pub tmp_directory: PathBuf,
    pub compress_threshold: u64,
    pub workers: usize,
    pub statement_timeout: Duration,
    pub fast_checkpoint: bool,
    pub session_mode: SessionMode,
    pub ignore_prefixes: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub spaces_config: Option<SpacesConfig>,
    pub local_storage_dir: Option<PathBuf>,
    pub raw_json_config: RawJsonConfig, // Store the parsed raw config
}

/// Command-line values that take precedence over config.json.
#[derive(Debug, Clone, Default)]
pub struct BackupOverrides {
    pub data_directory: Option<PathBuf>,
    pub tmp_directory: Option<PathBuf>,
    pub compress_threshold: Option<u64>,
    pub workers: Option<usize>,
    pub statement_timeout_secs: Option<u64>,
    pub fast_checkpoint: bool,
    pub exclusive: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: Option<String>,
}

impl AppConfig {
    /// Loads config.json if it exists; a missing file yields an empty configuration.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Self::from_raw(RawJsonConfig::default());
        }
        Self::load_from_json(config_path)
    }

    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        Self::from_raw(raw_json_config)
    }

    fn from_raw(raw_json_config: RawJsonConfig) -> Result<Self> {
        let spaces_config = raw_json_config.s3_storage.as_ref().and_then(|s3_raw| {
            if let (
                Some(bucket),
                Some(region),
                Some(key_id),
                Some(secret),
                Some(endpoint),
            ) = (
                s3_raw.bucket_name.as_ref().filter(|s| !s.is_empty()), // Ensure not empty
                s3_raw.region.as_ref().filter(|s| !s.is_empty()),
                s3_raw.access_key_id.as_ref().filter(|s| !s.is_empty()),
                s3_raw.secret_access_key.as_ref().filter(|s| !s.is_empty()),
                s3_raw.endpoint_url.as_ref().filter(|s| !s.is_empty()),
            ) {
                Some(SpacesConfig {
                    bucket_name: bucket.clone(),
                    region: region.clone(),
                    access_key_id: key_id.clone(),
                    secret_access_key: secret.clone(),
                    endpoint_url: endpoint.clone(),
                    folder_prefix: s3_raw.folder_prefix.clone().filter(|s| !s.is_empty()),
                    force_path_style: s3_raw.force_path_style.unwrap_or(false),
                })
            } else {
                tracing::warn!(
                    "s3_storage is present in config.json but some required fields (bucket_name, region, access_key_id, secret_access_key, endpoint_url) are missing or empty; S3 storage is disabled"
                );
                None
            }
        });

        Ok(AppConfig {
            spaces_config,
            local_storage_dir: raw_json_config.local_storage_dir.clone(),
            raw_json_config,
        })
    }
}

pub fn load_database_config(raw_config: &RawJsonConfig, overrides: &BackupOverrides) -> DatabaseConfig {
    let raw = raw_config.database.clone().unwrap_or_default();
    DatabaseConfig {
        host: overrides.host.clone().or(raw.host),
        port: overrides.port.or(raw.port),
        user: overrides
            .user
            .clone()
            .or(raw.user)
            .unwrap_or_else(|| DEFAULT_PG_USER.to_string()),
        password: overrides.password.clone().or(raw.password),
        ssl_mode: overrides.ssl_mode.clone().or(raw.ssl_mode),
        database: raw.database,
    }
}

pub fn load_backup_config(raw_config: &RawJsonConfig, overrides: &BackupOverrides) -> Result<BackupConfig> {
    let raw = raw_config.backup.clone().unwrap_or_default();

    let data_directory = overrides
        .data_directory
        .clone()
        .or(raw.data_directory)
        .context("data directory must be given with --data-directory or backup.data_directory in config.json")?;
    if !data_directory.is_dir() {
        return Err(anyhow::anyhow!(
            "Data directory is not a directory: {}",
            data_directory.display()
        ));
    }

    let workers = overrides.workers.or(raw.workers).unwrap_or(DEFAULT_WORKERS);
    if workers == 0 {
        return Err(anyhow::anyhow!("workers must be at least 1"));
    }

    let session_mode = if overrides.exclusive {
        SessionMode::Exclusive
    } else {
        raw.session_mode.unwrap_or_default()
    };

    let ignore_prefixes = raw
        .ignore_prefixes
        .unwrap_or_else(|| DEFAULT_IGNORE_PREFIXES.iter().map(|p| p.to_string()).collect())
        .into_iter()
        .map(|p| PathBuf::from(p.trim_start_matches('/')))
        .collect();

    Ok(BackupConfig {
        data_directory,
        tmp_directory: overrides
            .tmp_directory
            .clone()
            .or(raw.tmp_directory)
            .unwrap_or_else(std::env::temp_dir),
        compress_threshold: overrides
            .compress_threshold
            .or(raw.compress_threshold)
            .unwrap_or(DEFAULT_COMPRESS_THRESHOLD),
        workers,
        statement_timeout: Duration::from_secs(
            overrides
                .statement_timeout_secs
                .or(raw.statement_timeout_secs)
                .unwrap_or(DEFAULT_STATEMENT_TIMEOUT_SECS),
        ),
        fast_checkpoint: overrides.fast_checkpoint || raw.fast_checkpoint.unwrap_or(false),
        session_mode,
        ignore_prefixes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> anyhow::Result<RawJsonConfig> {
        Ok(serde_json::from_value(value)?)
    }

    #[test]
    fn test_backup_config_defaults() -> anyhow::Result<()> {
        let data_dir = tempfile::tempdir()?;
        let overrides = BackupOverrides {
            data_directory: Some(data_dir.path().to_path_buf()),
            ..Default::default()
        };
        let config = load_backup_config(&RawJsonConfig::default(), &overrides)?;

        assert_eq!(config.compress_threshold, 512 * 1024);
        assert_eq!(config.statement_timeout, Duration::from_secs(60));
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.session_mode, SessionMode::NonExclusive);
        assert!(!config.fast_checkpoint);
        assert!(config.ignore_prefixes.contains(&PathBuf::from("pg_wal")));
        assert!(config.ignore_prefixes.contains(&PathBuf::from("postmaster.pid")));
        Ok(())
    }

    #[test]
    fn test_cli_overrides_config_file() -> anyhow::Result<()> {
        let data_dir = tempfile::tempdir()?;
        let raw_config = raw(json!({
            "backup": {
                "data_directory": "/does/not/matter",
                "compress_threshold": 1024,
                "workers": 2,
                "session_mode": "non_exclusive",
                "ignore_prefixes": ["/pg_xlog", "pg_stat_tmp"]
            }
        }))?;
        let overrides = BackupOverrides {
            data_directory: Some(data_dir.path().to_path_buf()),
            workers: Some(8),
            exclusive: true,
            fast_checkpoint: true,
            ..Default::default()
        };
        let config = load_backup_config(&raw_config, &overrides)?;

        assert_eq!(config.data_directory, data_dir.path());
        assert_eq!(config.compress_threshold, 1024);
        assert_eq!(config.workers, 8);
        assert_eq!(config.session_mode, SessionMode::Exclusive);
        assert!(config.fast_checkpoint);
        assert_eq!(
            config.ignore_prefixes,
            vec![PathBuf::from("pg_xlog"), PathBuf::from("pg_stat_tmp")]
        );
        Ok(())
    }

    #[test]
    fn test_zero_workers_rejected() -> anyhow::Result<()> {
        let data_dir = tempfile::tempdir()?;
        let overrides = BackupOverrides {
            data_directory: Some(data_dir.path().to_path_buf()),
            workers: Some(0),
            ..Default::default()
        };
        assert!(load_backup_config(&RawJsonConfig::default(), &overrides).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_data_directory_rejected() {
        let result = load_backup_config(&RawJsonConfig::default(), &BackupOverrides::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_incomplete_s3_config_disables_s3() -> anyhow::Result<()> {
        let raw_config = raw(json!({
            "s3_storage": { "bucket_name": "backups", "region": "" },
            "local_storage_dir": "/var/backups/pg"
        }))?;
        let app_config = AppConfig::from_raw(raw_config)?;
        assert!(app_config.spaces_config.is_none());
        assert_eq!(app_config.local_storage_dir, Some(PathBuf::from("/var/backups/pg")));
        Ok(())
    }

    #[test]
    fn test_database_config_overrides_and_ssl_mode() -> anyhow::Result<()> {
        let raw_config = raw(json!({
            "database": { "host": "db.internal", "user": "replicator", "ssl_mode": "require" }
        }))?;
        let overrides = BackupOverrides {
            user: Some("backup".to_string()),
            ..Default::default()
        };
        let db = load_database_config(&raw_config, &overrides);
        assert_eq!(db.user, "backup");
        assert_eq!(db.host.as_deref(), Some("db.internal"));
        db.connect_options()?;

        let bad = DatabaseConfig {
            user: DEFAULT_PG_USER.to_string(),
            ssl_mode: Some("sometimes".to_string()),
            ..Default::default()
        };
        assert!(bad.connect_options().is_err());
        Ok(())
    }
}

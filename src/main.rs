//! PostgreSQL base backups to object storage
//!
//! Takes an online physical backup of a data directory and stores it as a
//! flat set of objects, with a success marker and a LATEST pointer.

// pgbasebackup-s3/src/main.rs
mod backup;
mod config;
mod errors;
mod storage;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{AppConfig, BackupOverrides};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pgbasebackup-s3", version, about = "PostgreSQL base backups to S3-compatible storage")]
struct Cli {
    /// Path to config.json; ignored when the file does not exist
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Take a new base backup
    CreateBackup(CreateBackupArgs),
    /// Print the name of the most recent successful backup
    Latest,
}

#[derive(Debug, Args)]
struct CreateBackupArgs {
    /// Backup name; must not already exist in the target storage
    name: String,

    /// Compress files larger than this many bytes
    #[arg(long)]
    compress_threshold: Option<u64>,

    #[arg(long, env = "PGUSER")]
    user: Option<String>,

    #[arg(long, env = "PGPASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long, env = "PGHOST")]
    host: Option<String>,

    #[arg(long, env = "PGPORT")]
    port: Option<u16>,

    /// disable, allow, prefer, require, verify-ca or verify-full
    #[arg(long, env = "PGSSLMODE")]
    ssl_mode: Option<String>,

    /// Start the backup as soon as possible by issuing a checkpoint
    #[arg(long)]
    checkpoint: bool,

    /// Exclusive backup (PostgreSQL 14 and older, primary only)
    #[arg(long)]
    exclusive: bool,

    /// Cancel a start/stop backup statement after this many seconds
    #[arg(long)]
    statement_timeout: Option<u64>,

    /// Number of concurrent upload workers
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, env = "PGDATA")]
    data_directory: Option<PathBuf>,

    /// Where compressed files are staged before upload
    #[arg(long)]
    tmp_directory: Option<PathBuf>,
}

impl From<&CreateBackupArgs> for BackupOverrides {
    fn from(args: &CreateBackupArgs) -> Self {
        BackupOverrides {
            data_directory: args.data_directory.clone(),
            tmp_directory: args.tmp_directory.clone(),
            compress_threshold: args.compress_threshold,
            workers: args.workers,
            statement_timeout_secs: args.statement_timeout,
            fast_checkpoint: args.checkpoint,
            exclusive: args.exclusive,
            host: args.host.clone(),
            port: args.port,
            user: args.user.clone(),
            password: args.password.clone(),
            ssl_mode: args.ssl_mode.clone(),
        }
    }
}

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run_app(Cli::parse()).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    let app_config = AppConfig::load(&cli.config)
        .context(format!("Failed to load application configuration from {}", cli.config.display()))?;

    match &cli.command {
        Command::CreateBackup(args) => {
            let report = backup::run_backup_flow(&app_config, &args.name, &BackupOverrides::from(args))
                .await
                .context("Backup process failed")?;
            println!(
                "✅ Backup {} completed: {} files ({} compressed, {} bytes), {} directories, {} skipped, {} vanished, {:.1}s",
                report.name,
                report.upload.files,
                report.upload.compressed,
                report.upload.bytes,
                report.upload.directories,
                report.upload.skipped,
                report.upload.vanished,
                report.duration.as_secs_f64()
            );
        }
        Command::Latest => match backup::run_latest_flow(&app_config).await? {
            Some(name) => println!("{}", name),
            None => anyhow::bail!("No successful backup has been recorded yet"),
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_backup_args_parse() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "pgbasebackup-s3",
            "create-backup",
            "nightly",
            "--compress-threshold",
            "1024",
            "--workers",
            "8",
            "--checkpoint",
            "--data-directory",
            "/var/lib/postgresql/data",
        ])?;

        let Command::CreateBackup(args) = &cli.command else {
            anyhow::bail!("expected create-backup");
        };
        let overrides = BackupOverrides::from(args);
        assert_eq!(args.name, "nightly");
        assert_eq!(overrides.compress_threshold, Some(1024));
        assert_eq!(overrides.workers, Some(8));
        assert!(overrides.fast_checkpoint);
        assert!(!overrides.exclusive);
        assert_eq!(overrides.data_directory, Some(PathBuf::from("/var/lib/postgresql/data")));
        assert_eq!(cli.config, PathBuf::from("config.json"));
        Ok(())
    }

    #[test]
    fn test_create_backup_requires_name() {
        assert!(Cli::try_parse_from(["pgbasebackup-s3", "create-backup"]).is_err());
    }
}

// pgbasebackup-s3/src/backup/session.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::SessionMode;
use crate::errors::AppError;

/// How often progress is logged while the server waits for WAL archiving.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// First server version with `pg_backup_start`/`pg_backup_stop` and without exclusive backups.
const PG15_VERSION_NUM: i32 = 150000;

/// Files the server hands back when a non-exclusive backup ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionArtifacts {
    pub lsn: String,
    pub backup_label: String,
    pub tablespace_map: Option<String>,
}

/// Opens the backup window on the server.
#[async_trait]
pub trait BackupSession: Send + Sync {
    async fn begin(&self, label: &str, fast_checkpoint: bool) -> Result<Box<dyn SessionHandle>>;
}

/// An open backup window. Consumed by `end`; dropping it without calling
/// `end` releases whatever it holds, which makes the server abandon the backup.
#[async_trait]
pub trait SessionHandle: Send {
    async fn end(self: Box<Self>) -> Result<Option<SessionArtifacts>>;
}

fn start_statement(mode: SessionMode, server_version: i32) -> std::result::Result<&'static str, AppError> {
    match (mode, server_version >= PG15_VERSION_NUM) {
        (SessionMode::NonExclusive, true) => Ok("SELECT pg_backup_start($1, $2)::text"),
        (SessionMode::NonExclusive, false) => Ok("SELECT pg_start_backup($1, $2, false)::text"),
        (SessionMode::Exclusive, false) => Ok("SELECT pg_start_backup($1, $2, true)::text"),
        (SessionMode::Exclusive, true) => Err(AppError::Protocol(format!(
            "exclusive backups are not supported by server version {}",
            server_version
        ))),
    }
}

fn stop_statement(mode: SessionMode, server_version: i32) -> &'static str {
    match (mode, server_version >= PG15_VERSION_NUM) {
        (SessionMode::NonExclusive, true) => "SELECT lsn::text, labelfile, spcmapfile FROM pg_backup_stop()",
        (SessionMode::NonExclusive, false) => {
            "SELECT lsn::text, labelfile, spcmapfile FROM pg_stop_backup(false)"
        }
        (SessionMode::Exclusive, _) => "SELECT pg_stop_backup()::text",
    }
}

async fn server_version(conn: &mut PgConnection) -> Result<i32> {
    sqlx::query_scalar("SELECT current_setting('server_version_num')::int")
        .fetch_one(conn)
        .await
        .context("Failed to read server_version_num")
}

async fn close_quietly(conn: PgConnection) {
    if let Err(e) = conn.close().await {
        // Nothing left to do with this connection either way.
        warn!(error = %e, "Failed to close the database connection");
    }
}

/// Runs `fut` under the statement timeout, turning expiry into a protocol error.
async fn with_deadline<T>(deadline: Duration, what: &str, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    timeout(deadline, fut).await.map_err(|_| {
        AppError::Protocol(format!("{} did not complete within {} seconds", what, deadline.as_secs()))
    })?
}

/// PostgreSQL implementation of the backup window protocol.
pub struct PgBackupSession {
    connect_options: PgConnectOptions,
    mode: SessionMode,
    statement_timeout: Duration,
    heartbeat_interval: Duration,
}

impl PgBackupSession {
    pub fn new(connect_options: PgConnectOptions, mode: SessionMode, statement_timeout: Duration) -> Self {
        Self {
            connect_options,
            mode,
            statement_timeout,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    async fn start(&self, label: &str, fast_checkpoint: bool) -> Result<Box<dyn SessionHandle>> {
        let mut conn = PgConnection::connect_with(&self.connect_options)
            .await
            .context("Failed to connect to the database")?;
        let version = server_version(&mut conn).await?;
        let statement = start_statement(self.mode, version)?;

        let lsn: String = sqlx::query_scalar(statement)
            .bind(label)
            .bind(fast_checkpoint)
            .fetch_one(&mut conn)
            .await
            .context("Failed to start backup")?;
        info!(lsn = %lsn, server_version = version, mode = ?self.mode, "Backup window opened");

        match self.mode {
            // This connection must stay open until the stop call, or the server cancels the backup.
            SessionMode::NonExclusive => Ok(Box::new(NonExclusiveHandle {
                conn,
                server_version: version,
                heartbeat_interval: self.heartbeat_interval,
            })),
            SessionMode::Exclusive => {
                close_quietly(conn).await;
                Ok(Box::new(ExclusiveHandle {
                    connect_options: self.connect_options.clone(),
                    statement_timeout: self.statement_timeout,
                    heartbeat_interval: self.heartbeat_interval,
                }))
            }
        }
    }
}

#[async_trait]
impl BackupSession for PgBackupSession {
    async fn begin(&self, label: &str, fast_checkpoint: bool) -> Result<Box<dyn SessionHandle>> {
        with_deadline(self.statement_timeout, "Starting the backup", self.start(label, fast_checkpoint)).await
    }
}

/// Logs periodically until dropped.
struct Heartbeat(JoinHandle<()>);

impl Heartbeat {
    fn start(interval: Duration) -> Self {
        let started = Instant::now();
        Heartbeat(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!(
                    waited_secs = started.elapsed().as_secs(),
                    "Still waiting for the server to stop the backup (WAL archiving)"
                );
            }
        }))
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Awaits a stop-backup call. There is no deadline: the server returns only once
/// the required WAL is archived, however long that takes.
async fn await_archiving<T>(heartbeat_interval: Duration, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    info!("Stopping backup, waiting for the required WAL to be archived");
    let _heartbeat = Heartbeat::start(heartbeat_interval);
    fut.await
}

/// Owns the connection that opened a non-exclusive backup.
struct NonExclusiveHandle {
    conn: PgConnection,
    server_version: i32,
    heartbeat_interval: Duration,
}

#[async_trait]
impl SessionHandle for NonExclusiveHandle {
    async fn end(self: Box<Self>) -> Result<Option<SessionArtifacts>> {
        let NonExclusiveHandle {
            mut conn,
            server_version,
            heartbeat_interval,
        } = *self;

        let stopped: (String, String, Option<String>) = await_archiving(heartbeat_interval, async {
            sqlx::query_as(stop_statement(SessionMode::NonExclusive, server_version))
                .fetch_one(&mut conn)
                .await
                .context("Failed to stop backup")
        })
        .await?;

        let (lsn, backup_label, tablespace_map) = stopped;
        info!(lsn = %lsn, "Backup window closed");
        close_quietly(conn).await;

        Ok(Some(SessionArtifacts {
            lsn,
            backup_label,
            tablespace_map,
        }))
    }
}

/// Exclusive backups keep no connection; the stop call uses a fresh one.
struct ExclusiveHandle {
    connect_options: PgConnectOptions,
    statement_timeout: Duration,
    heartbeat_interval: Duration,
}

#[async_trait]
impl SessionHandle for ExclusiveHandle {
    async fn end(self: Box<Self>) -> Result<Option<SessionArtifacts>> {
        let mut conn = with_deadline(self.statement_timeout, "Connecting to stop the backup", async {
            PgConnection::connect_with(&self.connect_options)
                .await
                .context("Failed to connect to the database")
        })
        .await?;

        let lsn: String = await_archiving(self.heartbeat_interval, async {
            sqlx::query_scalar(stop_statement(SessionMode::Exclusive, 0))
                .fetch_one(&mut conn)
                .await
                .context("Failed to stop backup")
        })
        .await?;
        info!(lsn = %lsn, "Backup window closed");
        close_quietly(conn).await;

        // backup_label was written into the data directory and has been uploaded with it.
        Ok(None)
    }
}

// pgbasebackup-s3/src/storage/mod.rs
pub(crate) mod local; // Directory-backed store, used for local targets and tests
pub(crate) mod s3; // S3-compatible object storage

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::errors::{AppError, Result};

pub use local::LocalStorage;
pub use s3::S3Storage;

/// Objects larger than this are uploaded in parts rather than with a single request.
pub const MULTIPART_THRESHOLD: u64 = 5 * 1024 * 1024;

/// Metadata key carrying the source file's modification time (unix seconds).
pub const MTIME_METADATA_KEY: &str = "mtime";

/// Flat key/value object store the backup is written into.
///
/// There is no notion of directories: keys ending in `/` are ordinary
/// (usually empty) objects. Implementations must be safe to share between
/// upload workers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Creates or overwrites a small textual object.
    async fn put_string(&self, key: &str, value: &str) -> Result<()>;

    /// Uploads the contents of `source` under `key`, recording `mtime` as metadata.
    ///
    /// Chunking of large payloads is the implementation's concern.
    async fn put(&self, key: &str, source: &Path, mtime: i64) -> Result<()>;

    /// Fetches a small textual object. Returns `AppError::NotFound` when absent.
    async fn get_string(&self, key: &str) -> Result<String>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Convenience wrapper over `get_string` that maps `NotFound` to `false`.
    async fn exists(&self, key: &str) -> Result<bool> {
        match self.get_string(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Builds the object store selected by the configuration. S3 wins when both are present.
pub async fn open_store(app_config: &AppConfig) -> Result<Arc<dyn ObjectStore>> {
    if let Some(spaces) = &app_config.spaces_config {
        return Ok(Arc::new(S3Storage::new(spaces).await));
    }
    if let Some(dir) = &app_config.local_storage_dir {
        return Ok(Arc::new(LocalStorage::new(dir)?));
    }
    Err(AppError::Config(
        "no storage target configured: set s3_storage or local_storage_dir in config.json".to_string(),
    ))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Wraps a `LocalStorage` and fails every write whose key contains `poison`.
    pub struct PoisonedStore {
        pub inner: LocalStorage,
        pub poison: &'static str,
    }

    impl PoisonedStore {
        fn check(&self, key: &str) -> Result<()> {
            if key.contains(self.poison) {
                return Err(AppError::Storage(format!("refusing to write {}", key)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ObjectStore for PoisonedStore {
        async fn put_string(&self, key: &str, value: &str) -> Result<()> {
            self.check(key)?;
            self.inner.put_string(key, value).await
        }

        async fn put(&self, key: &str, source: &Path, mtime: i64) -> Result<()> {
            self.check(key)?;
            self.inner.put(key, source, mtime).await
        }

        async fn get_string(&self, key: &str) -> Result<String> {
            self.inner.get_string(key).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
    }
}

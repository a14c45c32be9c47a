// pgbasebackup-s3/src/storage/local.rs
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::ObjectStore;
use crate::errors::{AppError, Result};

const OBJECT_EXTENSION: &str = "obj";
const METADATA_EXTENSION: &str = "json";
/// Longest hex run kept in one path component; longer keys are split into nested directories.
const MAX_SEGMENT_LEN: usize = 128;

#[derive(Debug, Serialize, Deserialize)]
struct ObjectMetadata {
    mtime: i64,
}

/// Object store kept in a single local directory.
///
/// Keys are hex-encoded into file names so `a/b` and `a/b/` can coexist,
/// the same way they do in a real object store. An encoded key longer than
/// one path component allows is split across nested directories.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self { root: root.to_path_buf() })
    }

    fn key_path(&self, key: &str, extension: &str) -> PathBuf {
        let encoded = hex::encode(key);
        let mut path = self.root.clone();
        let mut rest = encoded.as_str();
        while rest.len() > MAX_SEGMENT_LEN {
            let (segment, tail) = rest.split_at(MAX_SEGMENT_LEN);
            path.push(segment);
            rest = tail;
        }
        path.push(format!("{}.{}", rest, extension));
        path
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.key_path(key, OBJECT_EXTENSION)
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        self.key_path(key, METADATA_EXTENSION)
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    Ok(())
}

#[cfg(test)]
impl LocalStorage {
    /// Returns every key in the store, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|e| AppError::Storage(format!("listing {} failed: {}", self.root.display(), e)))?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some(OBJECT_EXTENSION) {
                continue;
            }
            let Ok(relative) = path.with_extension("").strip_prefix(&self.root).map(Path::to_path_buf) else {
                continue;
            };
            let encoded: String = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            let raw = hex::decode(&encoded)
                .map_err(|e| AppError::Storage(format!("corrupt object name {}: {}", path.display(), e)))?;
            keys.push(String::from_utf8(raw)?);
        }
        keys.sort();
        Ok(keys)
    }

    /// Reads an object's raw payload.
    pub fn read(&self, key: &str) -> Result<Vec<u8>> {
        std::fs::read(self.object_path(key)).map_err(|e| not_found_or_io(key, e))
    }

    /// Reads the modification time recorded for an object, if any.
    pub fn mtime(&self, key: &str) -> Result<Option<i64>> {
        match std::fs::read(self.metadata_path(key)) {
            Ok(raw) => Ok(Some(serde_json::from_slice::<ObjectMetadata>(&raw)?.mtime)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn not_found_or_io(key: &str, err: std::io::Error) -> AppError {
    if err.kind() == ErrorKind::NotFound {
        AppError::NotFound(key.to_string())
    } else {
        AppError::Io(err)
    }
}

#[async_trait]
impl ObjectStore for LocalStorage {
    async fn put_string(&self, key: &str, value: &str) -> Result<()> {
        debug!(key, "Writing object");
        write_file(&self.object_path(key), value.as_bytes()).await
    }

    async fn put(&self, key: &str, source: &Path, mtime: i64) -> Result<()> {
        debug!(key, source = %source.display(), "Writing object");
        let data = tokio::fs::read(source).await?;
        write_file(&self.object_path(key), &data).await?;
        let metadata = serde_json::to_vec(&ObjectMetadata { mtime })?;
        write_file(&self.metadata_path(key), &metadata).await
    }

    async fn get_string(&self, key: &str) -> Result<String> {
        let raw = tokio::fs::read(self.object_path(key))
            .await
            .map_err(|e| not_found_or_io(key, e))?;
        Ok(String::from_utf8(raw)?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        tokio::fs::remove_file(self.object_path(key))
            .await
            .map_err(|e| not_found_or_io(key, e))?;
        match tokio::fs::remove_file(self.metadata_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_and_file_keys_coexist() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = LocalStorage::new(dir.path())?;

        storage.put_string("nightly/base/", "").await?;
        storage.put_string("nightly/base", "not a directory").await?;

        assert_eq!(storage.get_string("nightly/base/").await?, "");
        assert_eq!(storage.get_string("nightly/base").await?, "not a directory");
        assert_eq!(storage.keys()?, vec!["nightly/base", "nightly/base/"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_long_keys_are_split_across_directories() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = LocalStorage::new(dir.path())?;
        let name = "a".repeat(100);
        let placeholder = format!("{}/", name);
        let key = format!("{}/pg_logical/snapshots/0-16B3D80.snap", name);
        let source = dir.path().join("snap");
        std::fs::write(&source, b"snapshot")?;

        storage.put_string(&placeholder, "").await?;
        storage.put(&key, &source, 1_700_000_000).await?;

        assert_eq!(storage.read(&key)?, b"snapshot");
        assert_eq!(storage.mtime(&key)?, Some(1_700_000_000));
        assert!(storage.exists(&placeholder).await?);
        assert_eq!(storage.keys()?, vec![placeholder.clone(), key.clone()]);
        for entry in walkdir::WalkDir::new(dir.path()) {
            assert!(entry?.file_name().len() <= MAX_SEGMENT_LEN + 5);
        }

        storage.delete(&key).await?;
        assert!(!storage.exists(&key).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = LocalStorage::new(dir.path())?;

        let err = storage.get_string("LATEST").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!storage.exists("LATEST").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_put_records_mtime_and_delete_removes_it() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = LocalStorage::new(&dir.path().join("store"))?;
        let source = dir.path().join("PG_VERSION");
        std::fs::write(&source, b"16\n")?;

        storage.put("nightly/PG_VERSION", &source, 1_700_000_000).await?;
        assert_eq!(storage.read("nightly/PG_VERSION")?, b"16\n");
        assert_eq!(storage.mtime("nightly/PG_VERSION")?, Some(1_700_000_000));

        storage.delete("nightly/PG_VERSION").await?;
        assert!(!storage.exists("nightly/PG_VERSION").await?);
        assert_eq!(storage.mtime("nightly/PG_VERSION")?, None);
        assert!(storage.delete("nightly/PG_VERSION").await.unwrap_err().is_not_found());
        Ok(())
    }
}

// pgbasebackup-s3/src/backup/compress.rs
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::{self, BufReader, Read};
use std::path::Path;
use tempfile::{Builder as TempFileBuilder, TempPath};

/// Suffix appended to the object key of every compressed file.
pub const COMPRESSED_SUFFIX: &str = ".gz";

/// Streams `input` through gzip into a new temporary file inside `tmp_dir`.
///
/// The caller opens the source, so a file removed before that point never
/// reaches here. The returned `TempPath` deletes the file when dropped.
pub fn compress_to_temp(input: impl Read, tmp_dir: &Path) -> Result<TempPath> {
    let temp_file = TempFileBuilder::new()
        .prefix("pgbasebackup-")
        .suffix(COMPRESSED_SUFFIX)
        .tempfile_in(tmp_dir)
        .with_context(|| format!("Failed to create temporary file in {}", tmp_dir.display()))?;

    let mut encoder = GzEncoder::new(temp_file, Compression::default());
    io::copy(&mut BufReader::new(input), &mut encoder).context("Failed to compress file")?;
    let temp_file = encoder.finish().context("Failed to finish gzip stream")?;

    Ok(temp_file.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::fs::File;

    #[test]
    fn test_compressed_output_decompresses_to_source() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("16384");
        let content: Vec<u8> = (0..200_000u32).flat_map(|i| (i % 251).to_le_bytes()).collect();
        std::fs::write(&source, &content)?;

        let compressed = compress_to_temp(File::open(&source)?, dir.path())?;
        assert!(compressed.to_string_lossy().ends_with(COMPRESSED_SUFFIX));

        let mut decoded = Vec::new();
        GzDecoder::new(File::open(&compressed)?).read_to_end(&mut decoded)?;
        assert_eq!(decoded, content);
        Ok(())
    }

    #[test]
    fn test_temp_file_removed_on_drop() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("PG_VERSION");
        std::fs::write(&source, b"16\n")?;

        let compressed = compress_to_temp(File::open(&source)?, dir.path())?;
        let path = compressed.to_path_buf();
        assert!(path.exists());
        drop(compressed);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_read_failure_leaves_no_temp_files() -> anyhow::Result<()> {
        struct FailingReader;
        impl Read for FailingReader {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::other("device error"))
            }
        }

        let dir = tempfile::tempdir()?;
        assert!(compress_to_temp(FailingReader, dir.path()).is_err());
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_missing_tmp_directory_fails() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(compress_to_temp(&b"16\n"[..], &dir.path().join("missing")).is_err());
        Ok(())
    }
}

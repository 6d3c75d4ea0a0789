//! The on-disk temporary artifact a transfer appends to.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

/// An open `.partial` file.
#[derive(Debug)]
pub struct PartialArtifact {
    path: PathBuf,
    writer: BufWriter<File>,
    len: u64,
}

impl PartialArtifact {
    /// Length of an existing partial artifact, 0 if there is none.
    pub async fn existing_len(path: &Path) -> u64 {
        tokio::fs::metadata(path).await.map_or(0, |m| m.len())
    }

    /// Opens the artifact, appending when `resume` is set and truncating otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open(path: &Path, resume: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(resume)
            .truncate(!resume)
            .open(path)
            .await?;
        let len = if resume {
            file.metadata().await?.len()
        } else {
            0
        };
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            len,
        })
    }

    /// Appends one chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn append(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.writer.write_all(chunk).await?;
        self.len += chunk.len() as u64;
        Ok(())
    }

    /// Bytes in the artifact, including resumed ones.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if nothing has been written.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Artifact path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes buffered bytes so a later resume sees them.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }

    /// Flushes and syncs the artifact, returning its final length.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or sync fails.
    pub async fn finish(mut self) -> io::Result<u64> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await?;
        Ok(self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn append_then_resume() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin.partial");
        assert_eq!(PartialArtifact::existing_len(&path).await, 0);

        let mut artifact = PartialArtifact::open(&path, false).await.unwrap();
        assert!(artifact.is_empty());
        artifact.append(b"hello ").await.unwrap();
        artifact.flush().await.unwrap();
        drop(artifact);
        assert_eq!(PartialArtifact::existing_len(&path).await, 6);

        let mut artifact = PartialArtifact::open(&path, true).await.unwrap();
        assert_eq!(artifact.len(), 6);
        artifact.append(b"world").await.unwrap();
        assert_eq!(artifact.finish().await.unwrap(), 11);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn open_without_resume_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin.partial");
        std::fs::write(&path, b"stale bytes").unwrap();

        let mut artifact = PartialArtifact::open(&path, false).await.unwrap();
        assert_eq!(artifact.path(), path.as_path());
        artifact.append(b"new").await.unwrap();
        artifact.finish().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }
}

//! File system abstraction for testability.

use std::io;
use std::path::Path;

use async_trait::async_trait;

/// A regular file found in the download directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// File name (no directory component).
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// Abstraction over the file system operations used by cleanup.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Lists regular files directly inside `dir`. A missing directory is empty.
    async fn list_files(&self, dir: &Path) -> io::Result<Vec<LocalFile>>;

    /// Returns the size of a file if it exists.
    async fn file_size(&self, path: &Path) -> Option<u64>;

    /// Removes a file.
    async fn remove_file(&self, path: &Path) -> io::Result<()>;
}

/// Default file system implementation using `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileSystem;

impl TokioFileSystem {
    /// Creates a new `TokioFileSystem` instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn list_files(&self, dir: &Path) -> io::Result<Vec<LocalFile>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("Skipping {}: {e}", entry.path().display());
                    continue;
                }
            };
            match entry.file_name().into_string() {
                Ok(name) => files.push(LocalFile {
                    name,
                    size: metadata.len(),
                }),
                Err(raw) => log::warn!("Skipping non UTF-8 file name {raw:?}"),
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn file_size(&self, path: &Path) -> Option<u64> {
        tokio::fs::metadata(path).await.ok().map(|m| m.len())
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}

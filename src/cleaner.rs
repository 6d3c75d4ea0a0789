//! Removal of files no bundle needs anymore.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::bundle::{check_file_name, is_partial_name, partial_path};
use crate::error::Result;
use crate::fs::{FileSystem, LocalFile, TokioFileSystem};

/// Outcome of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupResult {
    /// Final artifacts found in the directory (temporary artifacts excluded).
    pub total_local_files: usize,
    /// Files actually deleted.
    pub deleted_count: usize,
    /// Bytes freed by the deletions.
    pub freed_bytes: u64,
    /// Names of deleted files (or, for a dry run, files that would be deleted).
    pub deleted_names: Vec<String>,
}

/// Deletes files in the download directory that no descriptor references.
///
/// Temporary `.partial` artifacts are never orphan candidates; only
/// [`clean_temp_artifacts`](Self::clean_temp_artifacts) removes them.
#[derive(Debug, Clone)]
pub struct OrphanCleaner<F: FileSystem = TokioFileSystem> {
    download_dir: PathBuf,
    fs: F,
}

impl OrphanCleaner {
    /// Creates a cleaner over `download_dir` using the real file system.
    #[must_use]
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self::with_fs(download_dir, TokioFileSystem::new())
    }
}

impl<F: FileSystem> OrphanCleaner<F> {
    /// Creates a cleaner with a custom file system implementation.
    #[must_use]
    pub fn with_fs(download_dir: impl Into<PathBuf>, fs: F) -> Self {
        Self {
            download_dir: download_dir.into(),
            fs,
        }
    }

    async fn orphans(&self, required: &HashSet<String>) -> Result<(usize, Vec<LocalFile>)> {
        let (finals, _partials): (Vec<_>, Vec<_>) = self
            .fs
            .list_files(&self.download_dir)
            .await?
            .into_iter()
            .partition(|file| !is_partial_name(&file.name));
        let total = finals.len();
        let orphans = finals
            .into_iter()
            .filter(|file| !required.contains(&file.name))
            .collect();
        Ok((total, orphans))
    }

    /// Lists orphans without deleting anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub async fn scan_unused(&self, required: &HashSet<String>) -> Result<CleanupResult> {
        let (total_local_files, orphans) = self.orphans(required).await?;
        Ok(CleanupResult {
            total_local_files,
            deleted_count: 0,
            freed_bytes: orphans.iter().map(|file| file.size).sum(),
            deleted_names: orphans.into_iter().map(|file| file.name).collect(),
        })
    }

    /// Deletes every final artifact whose name is not in `required`.
    ///
    /// Files that cannot be deleted are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub async fn scan_and_clean_unused(&self, required: &HashSet<String>) -> Result<CleanupResult> {
        let (total_local_files, orphans) = self.orphans(required).await?;
        let mut result = CleanupResult {
            total_local_files,
            ..CleanupResult::default()
        };

        for file in orphans {
            let path = self.download_dir.join(&file.name);
            match self.fs.remove_file(&path).await {
                Ok(()) => {
                    log::debug!("Deleted unused {} ({} bytes)", file.name, file.size);
                    result.deleted_count += 1;
                    result.freed_bytes += file.size;
                    result.deleted_names.push(file.name);
                }
                Err(e) => log::warn!("Could not delete {}: {e}", path.display()),
            }
        }

        log::info!(
            "Cleanup removed {} of {} files, freed {} bytes",
            result.deleted_count,
            result.total_local_files,
            result.freed_bytes
        );
        Ok(result)
    }

    /// Deletes every temporary artifact, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub async fn clean_temp_artifacts(&self) -> Result<usize> {
        let mut removed = 0;
        for file in self.fs.list_files(&self.download_dir).await? {
            if !is_partial_name(&file.name) {
                continue;
            }
            let path = self.download_dir.join(&file.name);
            match self.fs.remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("Could not delete {}: {e}", path.display()),
            }
        }
        if removed > 0 {
            log::info!("Removed {removed} temporary artifacts");
        }
        Ok(removed)
    }

    /// Deletes the temporary artifact of `file_name`, if any.
    ///
    /// Returns the number of bytes discarded, `None` when there was no artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if `file_name` is not a plain name, or if the artifact
    /// exists but cannot be deleted.
    pub async fn discard_partial(&self, file_name: &str) -> Result<Option<u64>> {
        check_file_name(file_name)?;
        let path = partial_path(&self.download_dir.join(file_name));
        let Some(size) = self.fs.file_size(&path).await else {
            return Ok(None);
        };
        self.fs.remove_file(&path).await?;
        log::debug!("Discarded {} ({size} bytes)", path.display());
        Ok(Some(size))
    }
}

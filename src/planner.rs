//! Comparison of a bundle's descriptors against the download directory.

use std::path::PathBuf;
use std::sync::Arc;

use crate::bundle::{BundleId, FileDescriptor};
use crate::integrity::{IntegrityValidator, Verification};

/// What an update of one bundle would have to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCheckResult {
    /// Bundle that was checked.
    pub bundle_id: BundleId,
    /// Number of descriptors checked.
    pub total_files: usize,
    /// Files present and valid.
    pub up_to_date_count: usize,
    /// Files that are missing or invalid, in descriptor order.
    pub files_to_download: Vec<FileDescriptor>,
    /// Names of present but invalid files.
    pub files_to_delete: Vec<String>,
}

impl UpdateCheckResult {
    /// Returns true if any file needs to be downloaded.
    #[must_use]
    pub fn has_updates(&self) -> bool {
        !self.files_to_download.is_empty()
    }

    /// Returns true if every file is up to date.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.up_to_date_count == self.total_files
    }
}

/// Plans updates without touching the file system.
#[derive(Clone)]
pub struct DiffPlanner {
    download_dir: PathBuf,
    validator: Arc<dyn IntegrityValidator>,
}

impl DiffPlanner {
    /// Creates a planner over `download_dir`.
    #[must_use]
    pub fn new(download_dir: impl Into<PathBuf>, validator: Arc<dyn IntegrityValidator>) -> Self {
        Self {
            download_dir: download_dir.into(),
            validator,
        }
    }

    /// Classifies every descriptor of `bundle_id`.
    ///
    /// A file that exists but cannot be read is planned for download only;
    /// the transfer will overwrite it.
    pub async fn check_for_updates(
        &self,
        bundle_id: BundleId,
        files: &[FileDescriptor],
    ) -> UpdateCheckResult {
        let mut result = UpdateCheckResult {
            bundle_id,
            total_files: files.len(),
            up_to_date_count: 0,
            files_to_download: Vec::new(),
            files_to_delete: Vec::new(),
        };

        for file in files {
            let path = file.destination(&self.download_dir);
            match self.validator.verify(&path, file.expected_checksum()).await {
                Ok(Verification::Valid) => result.up_to_date_count += 1,
                Ok(Verification::Missing) => result.files_to_download.push(file.clone()),
                Ok(Verification::Empty | Verification::Mismatch { .. }) => {
                    result.files_to_delete.push(file.file_name().to_string());
                    result.files_to_download.push(file.clone());
                }
                Err(e) => {
                    log::warn!("Could not check {}: {e}", path.display());
                    result.files_to_download.push(file.clone());
                }
            }
        }

        log::debug!(
            "Bundle {bundle_id}: {}/{} up to date, {} to download, {} to delete",
            result.up_to_date_count,
            result.total_files,
            result.files_to_download.len(),
            result.files_to_delete.len()
        );
        result
    }
}

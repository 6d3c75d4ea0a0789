//! Resumable single-file transfers.
//!
//! A transfer writes into `<destination>.partial`, resumes from whatever that
//! artifact already holds, and renames it over the destination once the body
//! is complete. Two transports implement [`ResumableTransfer`]:
//! [`HttpTransfer`] for real origins and [`SyntheticTransfer`] for tests and
//! offline runs.

mod http;
mod partial;
mod synthetic;

pub use http::HttpTransfer;
pub use partial::PartialArtifact;
pub use synthetic::{SyntheticTransfer, synthetic_bytes};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bundle::{FileDescriptor, partial_path};
use crate::error::{Error, Result};
use crate::integrity::{IntegrityValidator, Verification, digest_hex};
use crate::stats::{TransferStats, TransferTracker};

/// Progress callback: `(bytes_so_far, total_expected)`.
///
/// `bytes_so_far` includes bytes resumed from the partial artifact.
pub type OnProgress = dyn Fn(u64, Option<u64>) + Send + Sync;

/// Everything a transport needs to fetch one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Final artifact name, used for logging and descriptor checks.
    pub file_name: String,
    /// Remote location.
    pub url: String,
    /// Final artifact path.
    pub destination: PathBuf,
    /// Hex checksum, empty to skip validation.
    pub expected_checksum: String,
    /// Transfer even if the destination is already valid.
    pub force_redownload: bool,
}

impl TransferRequest {
    /// Builds the request for `file` inside `download_dir`.
    #[must_use]
    pub fn for_file(file: &FileDescriptor, download_dir: &Path, force_redownload: bool) -> Self {
        Self {
            file_name: file.file_name().to_string(),
            url: file.source_url().to_string(),
            destination: file.destination(download_dir),
            expected_checksum: file.expected_checksum().to_string(),
            force_redownload,
        }
    }

    /// Path of the temporary artifact for this request.
    #[must_use]
    pub fn partial_path(&self) -> PathBuf {
        partial_path(&self.destination)
    }

    fn descriptor(&self) -> FileDescriptor {
        FileDescriptor::new(&self.file_name, &self.url, &self.expected_checksum)
    }
}

/// Result of one transfer call.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    /// The destination holds the complete (and, if requested, valid) file.
    Success {
        /// Final artifact path.
        path: PathBuf,
        /// What this call actually moved.
        stats: TransferStats,
    },
    /// The transfer could not complete.
    Failed {
        /// Human-readable reason.
        reason: String,
        /// Whether trying again may help.
        retryable: bool,
    },
    /// Cancellation was observed; the partial artifact is kept.
    Canceled,
}

impl TransferOutcome {
    /// Converts an error into a `Failed` outcome.
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        Self::Failed {
            reason: error.to_string(),
            retryable: error.is_retryable(),
        }
    }

    /// Returns true for `Success`.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A transport able to fetch one file with resume support.
#[async_trait]
pub trait ResumableTransfer: Send + Sync {
    /// Fetches `request.url` into `request.destination`.
    ///
    /// Never returns an error: every failure is folded into
    /// [`TransferOutcome::Failed`].
    async fn transfer(
        &self,
        request: &TransferRequest,
        on_progress: &OnProgress,
        cancel: &CancellationToken,
    ) -> TransferOutcome;
}

/// Checks the descriptor and whether the destination can be reused as is.
///
/// Returns `Some(outcome)` when no network I/O is needed or allowed.
pub(crate) async fn preflight(
    validator: &dyn IntegrityValidator,
    request: &TransferRequest,
) -> Option<TransferOutcome> {
    if let Err(e) = request.descriptor().validate() {
        return Some(TransferOutcome::from_error(&e));
    }
    if request.force_redownload {
        return None;
    }
    if validator
        .validate(&request.destination, &request.expected_checksum)
        .await
    {
        log::debug!("{} is already valid, skipping", request.file_name);
        return Some(TransferOutcome::Success {
            path: request.destination.clone(),
            stats: TransferStats::already_present(),
        });
    }
    None
}

/// Renames the finished partial artifact over the destination and validates it.
///
/// A checksum mismatch deletes the destination.
pub(crate) async fn finalize(
    validator: &dyn IntegrityValidator,
    request: &TransferRequest,
    tracker: TransferTracker,
    total_len: u64,
) -> Result<TransferStats> {
    tokio::fs::rename(request.partial_path(), &request.destination).await?;
    validator.invalidate(&request.destination);
    let stats = tracker.finish(total_len);

    if request.expected_checksum.trim().is_empty() {
        return Ok(stats);
    }
    let actual = match validator
        .verify(&request.destination, &request.expected_checksum)
        .await?
    {
        Verification::Valid => return Ok(stats),
        Verification::Mismatch { actual } => actual,
        Verification::Empty | Verification::Missing => digest_hex(&[]),
    };

    log::warn!(
        "{} failed validation, removing {}",
        request.file_name,
        request.destination.display()
    );
    if let Err(e) = tokio::fs::remove_file(&request.destination).await {
        log::warn!("Could not remove {}: {e}", request.destination.display());
    }
    validator.invalidate(&request.destination);
    Err(Error::ChecksumMismatch {
        expected: request.expected_checksum.trim().to_string(),
        actual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::{ChecksumValidator, PresenceValidator};
    use tempfile::TempDir;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn request(dir: &TempDir, checksum: &str) -> TransferRequest {
        TransferRequest::for_file(
            &FileDescriptor::new("hello.txt", "http://origin/hello.txt", checksum),
            dir.path(),
            false,
        )
    }

    #[test]
    fn request_paths() {
        let dir = TempDir::new().unwrap();
        let req = request(&dir, "");
        assert_eq!(req.destination, dir.path().join("hello.txt"));
        assert_eq!(req.partial_path(), dir.path().join("hello.txt.partial"));
    }

    #[test]
    fn outcome_from_error_keeps_retry_class() {
        let outcome = TransferOutcome::from_error(&Error::ChecksumMismatch {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        });
        assert_eq!(
            outcome,
            TransferOutcome::Failed {
                reason: "checksum mismatch: expected aa actual bb".to_string(),
                retryable: false,
            }
        );
    }

    #[tokio::test]
    async fn preflight_rejects_bad_descriptor() {
        let dir = TempDir::new().unwrap();
        let mut req = request(&dir, "");
        req.url = "not a url".to_string();
        let outcome = preflight(&ChecksumValidator::new(), &req).await;
        assert!(matches!(
            outcome,
            Some(TransferOutcome::Failed {
                retryable: false,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn preflight_short_circuits_valid_destination() {
        let dir = TempDir::new().unwrap();
        let req = request(&dir, HELLO_WORLD);
        std::fs::write(&req.destination, b"hello world").unwrap();

        let outcome = preflight(&ChecksumValidator::new(), &req).await.unwrap();
        let TransferOutcome::Success { stats, .. } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert!(stats.already_present);
    }

    #[tokio::test]
    async fn preflight_forced_goes_to_network() {
        let dir = TempDir::new().unwrap();
        let mut req = request(&dir, HELLO_WORLD);
        req.force_redownload = true;
        std::fs::write(&req.destination, b"hello world").unwrap();
        assert!(preflight(&ChecksumValidator::new(), &req).await.is_none());
    }

    #[tokio::test]
    async fn finalize_renames_and_validates() {
        let dir = TempDir::new().unwrap();
        let req = request(&dir, HELLO_WORLD);
        std::fs::write(req.partial_path(), b"hello world").unwrap();

        let stats = finalize(&ChecksumValidator::new(), &req, TransferTracker::start(0), 11)
            .await
            .unwrap();
        assert_eq!(stats.bytes_transferred, 11);
        assert!(!req.partial_path().exists());
        assert_eq!(std::fs::read(&req.destination).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn finalize_mismatch_deletes_destination() {
        let dir = TempDir::new().unwrap();
        let req = request(&dir, "00ff");
        std::fs::write(req.partial_path(), b"hello world").unwrap();

        let err = finalize(&ChecksumValidator::new(), &req, TransferTracker::start(0), 11)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("checksum mismatch: expected 00ff actual {HELLO_WORLD}")
        );
        assert!(!req.destination.exists());
        assert!(!req.partial_path().exists());
    }

    #[tokio::test]
    async fn finalize_without_checksum_skips_validation() {
        let dir = TempDir::new().unwrap();
        let req = request(&dir, "");
        std::fs::write(req.partial_path(), b"").unwrap();

        assert!(
            finalize(&PresenceValidator, &req, TransferTracker::start(0), 0)
                .await
                .is_ok()
        );
        assert!(req.destination.exists());
    }
}

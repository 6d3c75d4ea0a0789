//! Integrity validation of local files.
//!
//! Two strategies implement [`IntegrityValidator`]:
//! - [`ChecksumValidator`] streams files through SHA-256 and caches digests
//!   per absolute path.
//! - [`PresenceValidator`] only requires a non-empty file, for transports
//!   that do not serve real content.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::config::ValidationMode;
use crate::error::Result;

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Result of checking one local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// The file exists and satisfies the expected checksum.
    Valid,
    /// No file exists at the path.
    Missing,
    /// The file exists but is empty.
    Empty,
    /// The file exists but hashes to `actual`.
    Mismatch {
        /// Hex digest of the local file.
        actual: String,
    },
}

impl Verification {
    /// Returns true for [`Verification::Valid`].
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Strategy deciding whether a local file is intact.
#[async_trait]
pub trait IntegrityValidator: Send + Sync {
    /// Checks `path` against `expected_checksum`.
    ///
    /// An empty `expected_checksum` only requires the file to exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    async fn verify(&self, path: &Path, expected_checksum: &str) -> Result<Verification>;

    /// Forgets anything cached about `path`. Called after the file is rewritten.
    fn invalidate(&self, _path: &Path) {}

    /// Returns true if `path` passes [`verify`](Self::verify); read errors count as invalid.
    async fn validate(&self, path: &Path, expected_checksum: &str) -> bool {
        match self.verify(path, expected_checksum).await {
            Ok(verification) => verification.is_valid(),
            Err(e) => {
                log::warn!("Could not validate {}: {e}", path.display());
                false
            }
        }
    }
}

/// Builds the validator selected by `mode`.
#[must_use]
pub fn validator_for(mode: ValidationMode) -> Arc<dyn IntegrityValidator> {
    match mode {
        ValidationMode::Checksum => Arc::new(ChecksumValidator::new()),
        ValidationMode::Presence => Arc::new(PresenceValidator),
    }
}

/// Hex SHA-256 of an in-memory buffer.
#[must_use]
pub fn digest_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Compares two hex checksums, ignoring case and surrounding whitespace.
#[must_use]
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

/// Calculate the SHA-256 checksum of a file without loading it into memory.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub async fn compute_checksum(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Identity of a file's content as far as metadata can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

impl Fingerprint {
    fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedDigest {
    fingerprint: Fingerprint,
    checksum: String,
}

/// SHA-256 validator with a path-keyed digest cache.
///
/// A cached digest is reused only while the file's length and modification
/// time are unchanged; [`invalidate`](IntegrityValidator::invalidate) drops it
/// outright.
#[derive(Debug, Default)]
pub struct ChecksumValidator {
    cache: Mutex<HashMap<PathBuf, CachedDigest>>,
}

impl ChecksumValidator {
    /// Creates a validator with an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<PathBuf, CachedDigest>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache_key(path: &Path) -> PathBuf {
        std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
    }

    /// Number of cached digests.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache().len()
    }

    /// Checksum of `path`, from the cache when the file is unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub async fn checksum(&self, path: &Path) -> Result<String> {
        let key = Self::cache_key(path);
        let fingerprint = Fingerprint::of(&tokio::fs::metadata(path).await?);

        let cached = self
            .cache()
            .get(&key)
            .filter(|hit| hit.fingerprint == fingerprint)
            .map(|hit| hit.checksum.clone());
        if let Some(checksum) = cached {
            log::debug!("Checksum cache hit for {}", path.display());
            return Ok(checksum);
        }

        let checksum = compute_checksum(path).await?;
        self.cache().insert(
            key,
            CachedDigest {
                fingerprint,
                checksum: checksum.clone(),
            },
        );
        Ok(checksum)
    }
}

#[async_trait]
impl IntegrityValidator for ChecksumValidator {
    async fn verify(&self, path: &Path, expected_checksum: &str) -> Result<Verification> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(Verification::Missing),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Verification::Missing);
            }
            Err(e) => return Err(e.into()),
        };
        if expected_checksum.trim().is_empty() {
            return Ok(Verification::Valid);
        }
        if metadata.len() == 0 {
            // A zero-length file can still be legitimate content.
            let actual = digest_hex(&[]);
            return Ok(if checksums_match(expected_checksum, &actual) {
                Verification::Valid
            } else {
                Verification::Empty
            });
        }

        let actual = self.checksum(path).await?;
        if checksums_match(expected_checksum, &actual) {
            Ok(Verification::Valid)
        } else {
            Ok(Verification::Mismatch { actual })
        }
    }

    fn invalidate(&self, path: &Path) {
        self.cache().remove(&Self::cache_key(path));
    }
}

/// Validator that accepts any existing, non-empty file.
#[derive(Debug, Clone, Copy, Default)]
pub struct PresenceValidator;

#[async_trait]
impl IntegrityValidator for PresenceValidator {
    async fn verify(&self, path: &Path, _expected_checksum: &str) -> Result<Verification> {
        match tokio::fs::metadata(path).await {
            Ok(m) if !m.is_file() => Ok(Verification::Missing),
            Ok(m) if m.len() == 0 => Ok(Verification::Empty),
            Ok(_) => Ok(Verification::Valid),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Verification::Missing),
            Err(e) => Err(e.into()),
        }
    }
}

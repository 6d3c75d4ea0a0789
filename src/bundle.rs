//! Bundle and file descriptor types, plus the on-disk naming convention.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Suffix of the temporary artifact a transfer writes before the final rename.
///
/// Files carrying this suffix belong to an in-progress or resumable transfer
/// and are never treated as orphans.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Returns the temporary artifact path for a final destination path.
#[must_use]
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name: OsString = destination.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Returns true if `file_name` names a temporary artifact.
#[must_use]
pub fn is_partial_name(file_name: &str) -> bool {
    file_name.ends_with(PARTIAL_SUFFIX)
}

/// Checks that `name` is a plain file name inside a flat directory.
///
/// # Errors
///
/// Returns [`Error::InvalidDescriptor`] for an empty name, `.`, `..` or a
/// name containing a path separator.
pub fn check_file_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidDescriptor("empty file name".to_string()));
    }
    if name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(Error::InvalidDescriptor(format!(
            "file name {name:?} must be a plain name"
        )));
    }
    Ok(())
}

/// Opaque key identifying a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(pub u64);

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for BundleId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A single remote file belonging to a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileDescriptor {
    #[serde(alias = "fileName")]
    file_name: String,
    #[serde(alias = "sourceUrl", alias = "url")]
    source_url: String,
    #[serde(default, alias = "expectedChecksum", alias = "checksum")]
    expected_checksum: String,
}

impl FileDescriptor {
    /// Creates a descriptor. An empty `expected_checksum` disables validation.
    #[must_use]
    pub fn new(
        file_name: impl Into<String>,
        source_url: impl Into<String>,
        expected_checksum: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            source_url: source_url.into(),
            expected_checksum: expected_checksum.into(),
        }
    }

    /// Name of the final artifact inside the download directory.
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Remote location of the file.
    #[must_use]
    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// Hex checksum of the content, or empty when validation is skipped.
    #[must_use]
    pub fn expected_checksum(&self) -> &str {
        &self.expected_checksum
    }

    /// Returns true when the descriptor carries a checksum to verify against.
    #[must_use]
    pub fn has_checksum(&self) -> bool {
        !self.expected_checksum.trim().is_empty()
    }

    /// Final artifact path inside `download_dir`.
    #[must_use]
    pub fn destination(&self, download_dir: &Path) -> PathBuf {
        download_dir.join(&self.file_name)
    }

    /// Checks that the descriptor can be transferred into a flat directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDescriptor`] for an empty or nested file name,
    /// a name that collides with the temporary artifact suffix, or a missing
    /// or unparsable URL.
    pub fn validate(&self) -> Result<()> {
        let name = self.file_name.as_str();
        check_file_name(name)?;
        if is_partial_name(name) {
            return Err(Error::InvalidDescriptor(format!(
                "file name {name:?} uses the reserved {PARTIAL_SUFFIX} suffix"
            )));
        }
        if self.source_url.trim().is_empty() {
            return Err(Error::InvalidDescriptor(format!("{name}: missing source URL")));
        }
        reqwest::Url::parse(&self.source_url).map_err(|e| {
            Error::InvalidDescriptor(format!("{name}: bad source URL {:?}: {e}", self.source_url))
        })?;
        Ok(())
    }
}

/// A named, ordered set of files tracked under one state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// Bundle key.
    pub id: BundleId,
    /// Files in download order.
    #[serde(default)]
    pub files: Vec<FileDescriptor>,
}

impl Bundle {
    /// Creates a bundle from an id and its ordered files.
    #[must_use]
    pub const fn new(id: BundleId, files: Vec<FileDescriptor>) -> Self {
        Self { id, files }
    }

    /// Iterates over the final artifact names of this bundle.
    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(FileDescriptor::file_name)
    }
}

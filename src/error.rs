//! Error types for the bundle-dl library.

use thiserror::Error;

use crate::bundle::BundleId;

/// Errors that can occur while transferring, validating or cleaning bundles.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The origin answered with a non-success status.
    #[error("unexpected status {status} from {url}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code returned by the origin.
        status: u16,
    },

    /// The body ended before the advertised length was received.
    #[error("transfer incomplete: received {received} of {expected} bytes")]
    Incomplete {
        /// Bytes the origin advertised.
        expected: u64,
        /// Bytes persisted in the partial artifact.
        received: u64,
    },

    /// A partial response did not start where the resume asked it to.
    #[error("origin answered range starting at {start:?} instead of {offset}")]
    RangeMismatch {
        /// Requested resume offset.
        offset: u64,
        /// First byte position from `Content-Range`, if it could be parsed.
        start: Option<u64>,
    },

    /// A file descriptor was rejected before any network attempt.
    #[error("invalid file descriptor: {0}")]
    InvalidDescriptor(String),

    /// Downloaded content does not hash to the expected checksum.
    #[error("checksum mismatch: expected {expected} actual {actual}")]
    ChecksumMismatch {
        /// Checksum carried by the descriptor.
        expected: String,
        /// Checksum computed from the local file.
        actual: String,
    },

    /// The configuration file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The configuration could not be serialized.
    #[error("config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// The bundle already has a download attempt in flight.
    #[error("bundle {0} is already downloading")]
    AlreadyDownloading(BundleId),

    /// The engine was shut down and no longer accepts transfers.
    #[error("download engine is shut down")]
    Closed,
}

impl Error {
    /// Returns true if a later attempt of the same transfer may succeed.
    ///
    /// Checksum mismatches and descriptor errors are deterministic and are
    /// never worth repeating.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::Http(_)
            | Self::Incomplete { .. }
            | Self::RangeMismatch { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::InvalidDescriptor(_)
            | Self::ChecksumMismatch { .. }
            | Self::ConfigParse(_)
            | Self::ConfigSerialize(_)
            | Self::AlreadyDownloading(_)
            | Self::Closed => false,
        }
    }
}

/// A specialized `Result` type for bundle-dl operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_mismatch_message_names_both_digests() {
        let err = Error::ChecksumMismatch {
            expected: "abc".to_string(),
            actual: "def".to_string(),
        };
        assert_eq!(err.to_string(), "checksum mismatch: expected abc actual def");
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = Error::Status {
            url: "http://host/a".to_string(),
            status: 503,
        };
        assert!(err.is_retryable());

        let err = Error::Status {
            url: "http://host/a".to_string(),
            status: 404,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn misplaced_range_is_retryable() {
        let err = Error::RangeMismatch {
            offset: 400,
            start: Some(100),
        };
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "origin answered range starting at Some(100) instead of 400"
        );
    }

    #[test]
    fn deterministic_failures_are_not_retryable() {
        assert!(!Error::InvalidDescriptor("empty url".to_string()).is_retryable());
        assert!(
            !Error::ChecksumMismatch {
                expected: "a".to_string(),
                actual: "b".to_string(),
            }
            .is_retryable()
        );
        assert!(
            Error::Incomplete {
                expected: 10,
                received: 5,
            }
            .is_retryable()
        );
    }
}

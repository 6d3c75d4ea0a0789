//! bundle-dl - A library for downloading and maintaining feature bundles.
//!
//! A bundle is an ordered set of remote files that is tracked under a single
//! state. This library downloads bundles into one flat directory with
//! resumable transfers, bounds simultaneous transfers globally, validates
//! files against SHA-256 checksums, plans incremental updates and removes
//! files no bundle references anymore.
//!
//! # Example
//!
//! ```no_run
//! use bundle_dl::{BundleId, BundleState, DownloadEngine, EngineConfig, FileDescriptor};
//!
//! # async fn example() -> bundle_dl::Result<()> {
//! let config = EngineConfig::new().with_download_dir("/var/lib/app/bundles");
//! let engine = DownloadEngine::new(config)?;
//!
//! let files = vec![FileDescriptor::new(
//!     "voice-en.bin",
//!     "https://cdn.example.com/voice-en.bin",
//!     "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
//! )];
//!
//! let report = engine.download_bundle(BundleId(1), &files).await?;
//! if engine.query_state(BundleId(1)) == BundleState::Completed {
//!     println!("Downloaded {} files", report.files_downloaded);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod bundle;
pub mod catalog;
pub mod cleaner;
pub mod config;
pub mod engine;
pub mod error;
pub mod fs;
pub mod integrity;
pub mod limiter;
pub mod planner;
pub mod sink;
pub mod state;
pub mod stats;
pub mod transfer;

// Re-export main types for convenience
pub use bundle::{Bundle, BundleId, FileDescriptor, PARTIAL_SUFFIX};
pub use catalog::{CatalogNode, required_file_names};
pub use cleaner::{CleanupResult, OrphanCleaner};
pub use config::{EngineConfig, ValidationMode};
pub use engine::{DownloadEngine, DownloadEngineBuilder};
pub use error::{Error, Result};
pub use fs::{FileSystem, TokioFileSystem};
pub use integrity::{ChecksumValidator, IntegrityValidator, PresenceValidator, Verification};
pub use limiter::{ConcurrencyLimiter, TransferPermit};
pub use planner::{DiffPlanner, UpdateCheckResult};
pub use sink::{ChannelSink, LogSink, NoSink, StateChange, StateSink};
pub use state::BundleState;
pub use stats::{BundleReport, TransferStats};
pub use transfer::{
    HttpTransfer, ResumableTransfer, SyntheticTransfer, TransferOutcome, TransferRequest,
};

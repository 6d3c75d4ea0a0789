//! Configuration types for the download engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::limiter::DEFAULT_MAX_CONCURRENT_TRANSFERS;

/// How local files are judged valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Stream the file through SHA-256 and compare with the descriptor.
    #[default]
    Checksum,
    /// Only require the file to exist and be non-empty.
    Presence,
}

/// Configuration for the download engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Flat directory holding final and temporary artifacts.
    pub download_dir: PathBuf,
    /// Maximum number of transfers running at once across all bundles.
    pub max_concurrent_transfers: usize,
    /// Transfer files even when a valid copy is already on disk.
    pub force_redownload: bool,
    /// Validation strategy used by transfers, planning and completeness checks.
    pub validation: ValidationMode,
    /// Per-request timeout; `None` leaves it to the HTTP client.
    pub request_timeout_secs: Option<u64>,
    /// Attempts per file before the bundle fails. `1` disables retries.
    pub max_attempts_per_file: u32,
    /// Pause between attempts of the same file, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: Self::default_download_dir(),
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            force_redownload: false,
            validation: ValidationMode::Checksum,
            request_timeout_secs: None,
            max_attempts_per_file: 1,
            retry_delay_ms: 500,
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default download directory, `$XDG_DATA_HOME/bundle-dl/bundles`.
    #[must_use]
    pub fn default_download_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bundle-dl")
            .join("bundles")
    }

    /// Sets the download directory.
    #[must_use]
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// Sets the number of concurrent transfers.
    #[must_use]
    pub const fn with_max_concurrent_transfers(mut self, max: usize) -> Self {
        self.max_concurrent_transfers = max;
        self
    }

    /// Sets whether valid local files are transferred again.
    #[must_use]
    pub const fn with_force_redownload(mut self, force: bool) -> Self {
        self.force_redownload = force;
        self
    }

    /// Sets the validation strategy.
    #[must_use]
    pub const fn with_validation(mut self, validation: ValidationMode) -> Self {
        self.validation = validation;
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout_secs = match timeout {
            Some(t) => Some(t.as_secs()),
            None => None,
        };
        self
    }

    /// Sets the retry policy for failed files.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_retries(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.max_attempts_per_file = max_attempts;
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Per-request timeout as a `Duration`.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// Delay between attempts of the same file.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Number of attempts per file, never less than one.
    #[must_use]
    pub fn attempts_per_file(&self) -> u32 {
        self.max_attempts_per_file.max(1)
    }

    /// Parses a configuration from TOML. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML for this structure.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        log::debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Saves the configuration atomically (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, toml::to_string(self)?)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_transfers, 3);
        assert!(!config.force_redownload);
        assert_eq!(config.validation, ValidationMode::Checksum);
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.attempts_per_file(), 1);
        assert!(config.download_dir.to_string_lossy().contains("bundle-dl"));
    }

    #[test]
    fn builder_pattern() {
        let config = EngineConfig::new()
            .with_download_dir("/tmp/bundles")
            .with_max_concurrent_transfers(8)
            .with_force_redownload(true)
            .with_validation(ValidationMode::Presence)
            .with_request_timeout(Some(Duration::from_secs(30)))
            .with_retries(3, Duration::from_millis(250));

        assert_eq!(config.download_dir, PathBuf::from("/tmp/bundles"));
        assert_eq!(config.max_concurrent_transfers, 8);
        assert!(config.force_redownload);
        assert_eq!(config.validation, ValidationMode::Presence);
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.attempts_per_file(), 3);
        assert_eq!(config.retry_delay(), Duration::from_millis(250));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let config = EngineConfig::new().with_retries(0, Duration::ZERO);
        assert_eq!(config.attempts_per_file(), 1);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            download_dir = "/var/lib/features"
            validation = "presence"
            "#,
        )
        .unwrap();
        assert_eq!(config.download_dir, PathBuf::from("/var/lib/features"));
        assert_eq!(config.validation, ValidationMode::Presence);
        assert_eq!(config.max_concurrent_transfers, 3);
        assert_eq!(config.retry_delay_ms, 500);
    }

    #[test]
    fn unknown_validation_mode_is_an_error() {
        let err = EngineConfig::from_toml_str(r#"validation = "sometimes""#).unwrap_err();
        assert!(matches!(err, crate::Error::ConfigParse(_)));
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("engine.toml");
        let config = EngineConfig::new()
            .with_download_dir(dir.path().join("bundles"))
            .with_max_concurrent_transfers(5);

        config.save(&path).unwrap();
        assert!(!path.with_extension("toml.tmp").exists());

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}

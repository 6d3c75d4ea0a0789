//! Deterministic in-process transport.
//!
//! Content is derived from the URL alone, so the same URL always yields the
//! same bytes and checksum. The size comes from a `size=<bytes>` query
//! parameter, falling back to the transport default.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use super::{OnProgress, PartialArtifact, ResumableTransfer, TransferOutcome, TransferRequest};
use crate::error::{Error, Result};
use crate::integrity::{IntegrityValidator, digest_hex};
use crate::stats::TransferTracker;

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_SIZE: u64 = 256 * 1024;

/// Status reported for injected failures.
const INJECTED_STATUS: u16 = 503;

/// Bytes `start..end` of the synthetic content for `url`.
#[allow(clippy::cast_possible_truncation)]
fn synthetic_chunk(url: &str, start: u64, end: u64) -> Bytes {
    let seed = Sha256::digest(url.as_bytes());
    let mut buf = BytesMut::with_capacity(end.saturating_sub(start) as usize);
    for i in start..end {
        buf.put_u8(seed[(i % 32) as usize] ^ (i / 32) as u8);
    }
    buf.freeze()
}

/// The first `len` bytes of the synthetic content for `url`.
#[must_use]
pub fn synthetic_bytes(url: &str, len: u64) -> Bytes {
    synthetic_chunk(url, 0, len)
}

/// Transport generating content locally in fixed-size chunks.
pub struct SyntheticTransfer {
    validator: Arc<dyn IntegrityValidator>,
    chunk_size: usize,
    chunk_delay: Duration,
    default_size: u64,
    // `None` fails forever, `Some(n)` fails the next n requests.
    failures: Mutex<HashMap<String, Option<u32>>>,
    requested: Mutex<Vec<String>>,
    bytes_served: AtomicU64,
}

impl SyntheticTransfer {
    /// Creates a transport with 64 KiB chunks and no delay.
    #[must_use]
    pub fn new(validator: Arc<dyn IntegrityValidator>) -> Self {
        Self {
            validator,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: Duration::ZERO,
            default_size: DEFAULT_SIZE,
            failures: Mutex::new(HashMap::new()),
            requested: Mutex::new(Vec::new()),
            bytes_served: AtomicU64::new(0),
        }
    }

    /// Sets the chunk size. Zero is raised to one byte.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Sleeps this long before producing each chunk.
    #[must_use]
    pub const fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Size used for URLs without a `size` query parameter.
    #[must_use]
    pub const fn with_default_size(mut self, size: u64) -> Self {
        self.default_size = size;
        self
    }

    fn failures(&self) -> MutexGuard<'_, HashMap<String, Option<u32>>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn requested(&self) -> MutexGuard<'_, Vec<String>> {
        self.requested.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every request for `url` fail.
    pub fn fail_url(&self, url: impl Into<String>) {
        self.failures().insert(url.into(), None);
    }

    /// Makes the next `times` requests for `url` fail.
    pub fn fail_url_times(&self, url: impl Into<String>, times: u32) {
        self.failures().insert(url.into(), Some(times));
    }

    /// URLs requested so far, in order. Short-circuited transfers are not listed.
    #[must_use]
    pub fn requested_urls(&self) -> Vec<String> {
        self.requested().clone()
    }

    /// Total bytes produced across all transfers.
    #[must_use]
    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::Relaxed)
    }

    /// Content length for `url`.
    #[must_use]
    pub fn content_length(&self, url: &str) -> u64 {
        reqwest::Url::parse(url)
            .ok()
            .and_then(|url| {
                url.query_pairs()
                    .find(|(key, _)| key == "size")
                    .and_then(|(_, value)| value.parse().ok())
            })
            .unwrap_or(self.default_size)
    }

    /// Checksum the content of `url` will have.
    #[must_use]
    pub fn expected_checksum(&self, url: &str) -> String {
        digest_hex(&synthetic_bytes(url, self.content_length(url)))
    }

    fn injected_failure(&self, url: &str) -> Option<Error> {
        let mut failures = self.failures();
        match failures.get_mut(url)? {
            None => {}
            Some(0) => return None,
            Some(remaining) => *remaining -= 1,
        }
        Some(Error::Status {
            url: url.to_string(),
            status: INJECTED_STATUS,
        })
    }

    async fn run(
        &self,
        request: &TransferRequest,
        on_progress: &OnProgress,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        self.requested().push(request.url.clone());
        if let Some(error) = self.injected_failure(&request.url) {
            return Err(error);
        }
        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let total = self.content_length(&request.url);
        let partial = request.partial_path();
        let existing = PartialArtifact::existing_len(&partial).await;
        let resume = existing > 0 && existing <= total;
        if existing > total {
            log::warn!(
                "Partial for {} is longer than the content, restarting",
                request.file_name
            );
        } else if resume {
            log::debug!("Resuming {} from byte {existing}", request.file_name);
        }

        let tracker = TransferTracker::start(if resume { existing } else { 0 });
        let mut artifact = PartialArtifact::open(&partial, resume).await?;
        let chunk_size = self.chunk_size as u64;

        while artifact.len() < total {
            if cancel.is_cancelled() {
                artifact.flush().await?;
                log::info!(
                    "Transfer of {} canceled at {} bytes",
                    request.file_name,
                    artifact.len()
                );
                return Ok(TransferOutcome::Canceled);
            }
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            let start = artifact.len();
            let end = (start + chunk_size).min(total);
            artifact
                .append(&synthetic_chunk(&request.url, start, end))
                .await?;
            self.bytes_served.fetch_add(end - start, Ordering::Relaxed);
            on_progress(artifact.len(), Some(total));
        }

        let received = artifact.finish().await?;
        let stats = super::finalize(self.validator.as_ref(), request, tracker, received).await?;
        Ok(TransferOutcome::Success {
            path: request.destination.clone(),
            stats,
        })
    }
}

#[async_trait]
impl ResumableTransfer for SyntheticTransfer {
    async fn transfer(
        &self,
        request: &TransferRequest,
        on_progress: &OnProgress,
        cancel: &CancellationToken,
    ) -> TransferOutcome {
        if let Some(outcome) = super::preflight(self.validator.as_ref(), request).await {
            return outcome;
        }
        match self.run(request, on_progress, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Transfer of {} failed: {e}", request.file_name);
                TransferOutcome::from_error(&e)
            }
        }
    }
}

//! Transfer and bundle statistics.

use std::time::{Duration, Instant};

/// Statistics for a single file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    /// Bytes received over the network in this call.
    pub bytes_transferred: u64,
    /// Offset the transfer resumed from (0 for a fresh transfer).
    pub resumed_from: u64,
    /// Time spent in the transfer.
    pub elapsed: Duration,
    /// The destination was already valid and no transfer took place.
    pub already_present: bool,
}

impl TransferStats {
    /// Statistics for a file that was already valid on disk.
    #[must_use]
    pub const fn already_present() -> Self {
        Self {
            bytes_transferred: 0,
            resumed_from: 0,
            elapsed: Duration::ZERO,
            already_present: true,
        }
    }

    /// Returns the average transfer speed in bytes per second.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn average_speed(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.bytes_transferred as f64 / secs) as u64
        } else {
            0
        }
    }
}

/// Internal helper for timing one transfer.
#[derive(Debug)]
pub struct TransferTracker {
    start_time: Instant,
    resumed_from: u64,
}

impl TransferTracker {
    /// Starts timing a transfer that resumes from `resumed_from`.
    #[must_use]
    pub fn start(resumed_from: u64) -> Self {
        Self {
            start_time: Instant::now(),
            resumed_from,
        }
    }

    /// Offset the transfer resumed from.
    #[must_use]
    pub const fn resumed_from(&self) -> u64 {
        self.resumed_from
    }

    /// Records that the origin ignored the resume offset.
    pub const fn restarted(&mut self) {
        self.resumed_from = 0;
    }

    /// Final statistics once `total_len` bytes are in the partial artifact.
    #[must_use]
    pub fn finish(self, total_len: u64) -> TransferStats {
        TransferStats {
            bytes_transferred: total_len.saturating_sub(self.resumed_from),
            resumed_from: self.resumed_from,
            elapsed: self.start_time.elapsed(),
            already_present: false,
        }
    }
}

/// Summary of one bundle attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleReport {
    /// Files transferred (fully or resumed) in this attempt.
    pub files_downloaded: usize,
    /// Files already valid on disk.
    pub files_skipped: usize,
    /// Bytes received over the network.
    pub bytes_transferred: u64,
    /// Files resumed from a partial artifact.
    pub files_resumed: usize,
    /// Wall-clock time of the attempt.
    pub elapsed: Duration,
}

/// Builder for accumulating a [`BundleReport`] during an attempt.
#[derive(Debug)]
pub struct BundleReportBuilder {
    report: BundleReport,
    start_time: Instant,
}

impl Default for BundleReportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BundleReportBuilder {
    /// Starts a report; elapsed time is measured from here.
    #[must_use]
    pub fn new() -> Self {
        Self {
            report: BundleReport::default(),
            start_time: Instant::now(),
        }
    }

    /// Records one successful transfer.
    pub const fn add_transfer(&mut self, stats: &TransferStats) {
        if stats.already_present {
            self.report.files_skipped += 1;
            return;
        }
        self.report.files_downloaded += 1;
        self.report.bytes_transferred += stats.bytes_transferred;
        if stats.resumed_from > 0 {
            self.report.files_resumed += 1;
        }
    }

    /// Adds files counted as skipped outside the transfer loop.
    pub const fn add_skipped(&mut self, count: usize) {
        self.report.files_skipped += count;
    }

    /// Builds the final report.
    #[must_use]
    pub fn build(mut self) -> BundleReport {
        self.report.elapsed = self.start_time.elapsed();
        self.report
    }
}

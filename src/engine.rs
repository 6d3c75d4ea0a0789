//! Bundle download orchestration.
//!
//! [`DownloadEngine`] runs each bundle attempt as a sequence of single-file
//! transfers. Every transfer waits on the shared [`ConcurrencyLimiter`], so
//! the configured capacity bounds transfers across all bundles. Progress and
//! outcomes are published through the per-bundle [`BundleState`] cells.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::bundle::{Bundle, BundleId, FileDescriptor};
use crate::cleaner::{CleanupResult, OrphanCleaner};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::integrity::{IntegrityValidator, validator_for};
use crate::limiter::ConcurrencyLimiter;
use crate::planner::{DiffPlanner, UpdateCheckResult};
use crate::sink::{LogSink, StateSink};
use crate::state::{BundleState, StateStore, aggregate_progress};
use crate::stats::{BundleReport, BundleReportBuilder};
use crate::transfer::{HttpTransfer, ResumableTransfer, TransferOutcome, TransferRequest};

/// Builder for [`DownloadEngine`].
pub struct DownloadEngineBuilder {
    config: EngineConfig,
    transfer: Option<Arc<dyn ResumableTransfer>>,
    validator: Option<Arc<dyn IntegrityValidator>>,
    sink: Option<Arc<dyn StateSink>>,
}

impl DownloadEngineBuilder {
    /// Uses `transfer` instead of the default [`HttpTransfer`].
    #[must_use]
    pub fn transfer(mut self, transfer: Arc<dyn ResumableTransfer>) -> Self {
        self.transfer = Some(transfer);
        self
    }

    /// Uses `validator` instead of the one selected by the configuration.
    #[must_use]
    pub fn validator(mut self, validator: Arc<dyn IntegrityValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Publishes state transitions to `sink` instead of the log.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn StateSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the default HTTP transport cannot be created.
    pub fn build(self) -> Result<DownloadEngine> {
        let config = self.config;
        let validator = self
            .validator
            .unwrap_or_else(|| validator_for(config.validation));
        let transfer = match self.transfer {
            Some(transfer) => transfer,
            None => Arc::new(HttpTransfer::from_config(&config, Arc::clone(&validator))?),
        };
        let sink = self.sink.unwrap_or_else(|| Arc::new(LogSink));

        Ok(DownloadEngine {
            limiter: ConcurrencyLimiter::new(config.max_concurrent_transfers),
            states: Arc::new(StateStore::new(sink)),
            planner: DiffPlanner::new(&config.download_dir, Arc::clone(&validator)),
            cleaner: OrphanCleaner::new(&config.download_dir),
            attempts: Mutex::new(HashMap::new()),
            run_locks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            config,
            transfer,
            validator,
        })
    }
}

/// A registered attempt that has not started transferring yet.
struct Attempt {
    bundle_id: BundleId,
    generation: u64,
    cancel: CancellationToken,
}

/// Downloads, verifies and cleans bundles in one download directory.
pub struct DownloadEngine {
    config: EngineConfig,
    transfer: Arc<dyn ResumableTransfer>,
    validator: Arc<dyn IntegrityValidator>,
    limiter: ConcurrencyLimiter,
    states: Arc<StateStore>,
    planner: DiffPlanner,
    cleaner: OrphanCleaner,
    // Cancellation token of each bundle's current attempt.
    attempts: Mutex<HashMap<BundleId, (u64, CancellationToken)>>,
    // Serializes attempts of one bundle, so a canceled attempt that has not
    // reached its next chunk boundary never shares a partial artifact.
    run_locks: Mutex<HashMap<BundleId, Arc<tokio::sync::Mutex<()>>>>,
    shutdown: CancellationToken,
}

impl DownloadEngine {
    /// Starts building an engine for `config`.
    #[must_use]
    pub const fn builder(config: EngineConfig) -> DownloadEngineBuilder {
        DownloadEngineBuilder {
            config,
            transfer: None,
            validator: None,
            sink: None,
        }
    }

    /// Creates an engine with the HTTP transport and default collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Returns a reference to the engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The limiter shared by every transfer.
    #[must_use]
    pub const fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    fn attempts(&self) -> MutexGuard<'_, HashMap<BundleId, (u64, CancellationToken)>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_lock(&self, bundle_id: BundleId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.run_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(bundle_id).or_default())
    }

    /// Moves the bundle to `Downloading` and registers its cancellation token.
    fn start_attempt(&self, bundle_id: BundleId, total_count: usize) -> Result<Attempt> {
        if self.limiter.is_closed() {
            return Err(Error::Closed);
        }
        let generation = self.states.begin(bundle_id, total_count)?;
        let cancel = self.shutdown.child_token();
        self.attempts()
            .insert(bundle_id, (generation, cancel.clone()));
        log::info!("Bundle {bundle_id}: starting attempt with {total_count} files");
        Ok(Attempt {
            bundle_id,
            generation,
            cancel,
        })
    }

    fn end_attempt(&self, attempt: &Attempt) {
        let mut attempts = self.attempts();
        if attempts
            .get(&attempt.bundle_id)
            .is_some_and(|(generation, _)| *generation == attempt.generation)
        {
            attempts.remove(&attempt.bundle_id);
        }
    }

    /// Waits until the bundle's previous attempt has let go of its artifacts.
    ///
    /// Returns `None`, with the attempt ended as `Canceled`, if the attempt is
    /// canceled while waiting.
    async fn acquire_run(&self, attempt: &Attempt) -> Option<OwnedMutexGuard<()>> {
        let lock = self.run_lock(attempt.bundle_id);
        tokio::select! {
            biased;
            () = attempt.cancel.cancelled() => {
                log::debug!("Bundle {}: canceled before it could start", attempt.bundle_id);
                self.states
                    .update(attempt.bundle_id, attempt.generation, BundleState::Canceled);
                self.end_attempt(attempt);
                None
            }
            guard = lock.lock_owned() => Some(guard),
        }
    }

    async fn run(&self, attempt: Attempt, files: &[FileDescriptor]) -> BundleReport {
        let report = BundleReportBuilder::new();
        let Some(_running) = self.acquire_run(&attempt).await else {
            return report.build();
        };
        self.run_locked(&attempt, files, report).await
    }

    /// Transfers `files` in order; the first failure or cancellation ends the attempt.
    async fn run_locked(
        &self,
        attempt: &Attempt,
        files: &[FileDescriptor],
        mut report: BundleReportBuilder,
    ) -> BundleReport {
        let (bundle_id, generation, cancel) =
            (attempt.bundle_id, attempt.generation, &attempt.cancel);
        let total = files.len();

        for (completed, file) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                self.states.update(bundle_id, generation, BundleState::Canceled);
                self.end_attempt(attempt);
                return report.build();
            }
            self.states.update(
                bundle_id,
                generation,
                BundleState::Downloading {
                    progress: aggregate_progress(completed, 0.0, total),
                    current_file: Some(file.file_name().to_string()),
                    completed_count: completed,
                    total_count: total,
                },
            );

            match self.transfer_file(attempt, file, completed, total).await {
                TransferOutcome::Success { stats, .. } => report.add_transfer(&stats),
                TransferOutcome::Failed { reason, .. } => {
                    log::error!("Bundle {bundle_id}: {} failed: {reason}", file.file_name());
                    self.states.update(
                        bundle_id,
                        generation,
                        BundleState::Failed {
                            error: reason,
                            failed_file: file.file_name().to_string(),
                        },
                    );
                    self.end_attempt(attempt);
                    return report.build();
                }
                TransferOutcome::Canceled => {
                    self.states.update(bundle_id, generation, BundleState::Canceled);
                    self.end_attempt(attempt);
                    return report.build();
                }
            }
        }

        self.states.update(bundle_id, generation, BundleState::Completed);
        self.end_attempt(attempt);
        let report = report.build();
        log::info!(
            "Bundle {bundle_id}: completed, {} downloaded, {} already present, {} bytes in {:.1?}",
            report.files_downloaded,
            report.files_skipped,
            report.bytes_transferred,
            report.elapsed
        );
        report
    }

    /// Transfers one file, retrying retryable failures up to the configured limit.
    async fn transfer_file(
        &self,
        attempt: &Attempt,
        file: &FileDescriptor,
        completed: usize,
        total: usize,
    ) -> TransferOutcome {
        if let Err(e) = file.validate() {
            return TransferOutcome::from_error(&e);
        }
        let request = TransferRequest::for_file(
            file,
            &self.config.download_dir,
            self.config.force_redownload,
        );
        let max_attempts = self.config.attempts_per_file();

        let mut tries = 1;
        loop {
            match self.transfer_once(attempt, &request, completed, total).await {
                TransferOutcome::Failed {
                    reason,
                    retryable: true,
                } if tries < max_attempts => {
                    log::warn!(
                        "{} failed (try {tries}/{max_attempts}): {reason}; retrying",
                        request.file_name
                    );
                    tries += 1;
                    tokio::select! {
                        biased;
                        () = attempt.cancel.cancelled() => return TransferOutcome::Canceled,
                        () = tokio::time::sleep(self.config.retry_delay()) => {}
                    }
                }
                outcome => return outcome,
            }
        }
    }

    async fn transfer_once(
        &self,
        attempt: &Attempt,
        request: &TransferRequest,
        completed: usize,
        total: usize,
    ) -> TransferOutcome {
        let _permit = tokio::select! {
            biased;
            () = attempt.cancel.cancelled() => return TransferOutcome::Canceled,
            permit = self.limiter.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return TransferOutcome::Canceled,
            },
        };

        let states = Arc::clone(&self.states);
        let (bundle_id, generation) = (attempt.bundle_id, attempt.generation);
        let file_name = request.file_name.clone();
        #[allow(clippy::cast_precision_loss)]
        let on_progress = move |done: u64, expected: Option<u64>| {
            let fraction = expected
                .filter(|&expected| expected > 0)
                .map_or(0.0, |expected| done as f64 / expected as f64);
            states.update(
                bundle_id,
                generation,
                BundleState::Downloading {
                    progress: aggregate_progress(completed, fraction, total),
                    current_file: Some(file_name.clone()),
                    completed_count: completed,
                    total_count: total,
                },
            );
        };

        self.transfer
            .transfer(request, &on_progress, &attempt.cancel)
            .await
    }

    /// Downloads every file of a bundle, in order.
    ///
    /// Per-file outcomes are reported through the bundle state; the returned
    /// report describes what this attempt moved.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyDownloading`] if an attempt is running and
    /// [`Error::Closed`] after [`shutdown`](Self::shutdown).
    pub async fn download_bundle(
        &self,
        bundle_id: BundleId,
        files: &[FileDescriptor],
    ) -> Result<BundleReport> {
        let attempt = self.start_attempt(bundle_id, files.len())?;
        Ok(self.run(attempt, files).await)
    }

    /// Runs a new attempt over the same files after a failure or cancellation.
    ///
    /// # Errors
    ///
    /// See [`download_bundle`](Self::download_bundle).
    pub async fn retry_bundle(
        &self,
        bundle_id: BundleId,
        files: &[FileDescriptor],
    ) -> Result<BundleReport> {
        log::info!("Bundle {bundle_id}: retrying");
        self.download_bundle(bundle_id, files).await
    }

    /// Starts [`download_bundle`](Self::download_bundle) on a new task.
    ///
    /// The bundle is already `Downloading` when this returns.
    ///
    /// # Errors
    ///
    /// See [`download_bundle`](Self::download_bundle).
    pub fn spawn_download(self: &Arc<Self>, bundle: Bundle) -> Result<JoinHandle<BundleReport>> {
        let attempt = self.start_attempt(bundle.id, bundle.files.len())?;
        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move {
            engine.run(attempt, &bundle.files).await
        }))
    }

    /// Replaces invalid files and downloads missing ones.
    ///
    /// Files already valid count as skipped in the report.
    ///
    /// # Errors
    ///
    /// See [`download_bundle`](Self::download_bundle).
    pub async fn update_bundle(
        &self,
        bundle_id: BundleId,
        files: &[FileDescriptor],
    ) -> Result<BundleReport> {
        if self.states.current(bundle_id).is_downloading() {
            return Err(Error::AlreadyDownloading(bundle_id));
        }
        let plan = self.planner.check_for_updates(bundle_id, files).await;
        let attempt = self.start_attempt(bundle_id, plan.files_to_download.len())?;

        let mut report = BundleReportBuilder::new();
        report.add_skipped(plan.up_to_date_count);
        let Some(_running) = self.acquire_run(&attempt).await else {
            return Ok(report.build());
        };
        for name in &plan.files_to_delete {
            let path = self.config.download_dir.join(name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => log::debug!("Bundle {bundle_id}: removed stale {name}"),
                Err(e) => log::warn!("Could not remove stale {}: {e}", path.display()),
            }
            self.validator.invalidate(&path);
        }

        Ok(self
            .run_locked(&attempt, &plan.files_to_download, report)
            .await)
    }

    /// Cancels the bundle's running attempt.
    ///
    /// The state moves to `Canceled` at once; the transfer stops while waiting
    /// for a permit or the origin, or at its next chunk boundary, and keeps its
    /// partial artifact. Returns false if the
    /// bundle was not downloading.
    pub fn cancel_bundle(&self, bundle_id: BundleId) -> bool {
        let canceled = self.states.cancel(bundle_id);
        if let Some((_, token)) = self.attempts().get(&bundle_id) {
            token.cancel();
        }
        if canceled {
            log::info!("Bundle {bundle_id}: canceled");
        }
        canceled
    }

    /// Stream of the bundle's states, starting with the current one.
    #[must_use]
    pub fn observe_state(&self, bundle_id: BundleId) -> WatchStream<BundleState> {
        WatchStream::new(self.states.subscribe(bundle_id))
    }

    /// Current state of a bundle.
    #[must_use]
    pub fn query_state(&self, bundle_id: BundleId) -> BundleState {
        self.states.current(bundle_id)
    }

    /// States of every bundle referenced so far, ordered by id.
    #[must_use]
    pub fn states(&self) -> Vec<(BundleId, BundleState)> {
        self.states.snapshot()
    }

    /// Returns a finished bundle to `Idle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyDownloading`] while an attempt is running.
    pub fn reset_state(&self, bundle_id: BundleId) -> Result<()> {
        self.states.reset(bundle_id)
    }

    /// Returns true if every file of the bundle is present and valid.
    pub async fn is_bundle_complete(&self, bundle_id: BundleId, files: &[FileDescriptor]) -> bool {
        for file in files {
            let path = file.destination(&self.config.download_dir);
            if !self.validator.validate(&path, file.expected_checksum()).await {
                log::debug!("Bundle {bundle_id}: {} is missing or invalid", file.file_name());
                return false;
            }
        }
        true
    }

    /// Plans an update without changing anything on disk.
    pub async fn check_for_updates(
        &self,
        bundle_id: BundleId,
        files: &[FileDescriptor],
    ) -> UpdateCheckResult {
        self.planner.check_for_updates(bundle_id, files).await
    }

    /// Deletes every final artifact not in `required_file_names`.
    ///
    /// # Errors
    ///
    /// Returns an error if the download directory cannot be listed.
    pub async fn scan_and_clean_unused(
        &self,
        required_file_names: &HashSet<String>,
    ) -> Result<CleanupResult> {
        self.cleaner.scan_and_clean_unused(required_file_names).await
    }

    /// Lists what [`scan_and_clean_unused`](Self::scan_and_clean_unused) would delete.
    ///
    /// # Errors
    ///
    /// Returns an error if the download directory cannot be listed.
    pub async fn scan_unused(&self, required_file_names: &HashSet<String>) -> Result<CleanupResult> {
        self.cleaner.scan_unused(required_file_names).await
    }

    /// Deletes every temporary artifact.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyDownloading`] while any bundle is downloading,
    /// or an error if the download directory cannot be listed.
    pub async fn clean_temp_artifacts(&self) -> Result<usize> {
        if let Some((bundle_id, _)) = self
            .states
            .snapshot()
            .into_iter()
            .find(|(_, state)| state.is_downloading())
        {
            return Err(Error::AlreadyDownloading(bundle_id));
        }
        self.cleaner.clean_temp_artifacts().await
    }

    /// Deletes the temporary artifact of one file so its next transfer starts over.
    ///
    /// # Errors
    ///
    /// Returns an error if `file_name` is not a plain name or the artifact
    /// cannot be deleted.
    pub async fn discard_partial(&self, file_name: &str) -> Result<Option<u64>> {
        self.cleaner.discard_partial(file_name).await
    }

    /// Cancels every running attempt and rejects new ones.
    pub fn shutdown(&self) {
        log::info!("Shutting down download engine");
        self.limiter.close();
        self.shutdown.cancel();
    }
}

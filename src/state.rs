//! Per-bundle state machine and the store that owns every bundle's state.
//!
//! Each bundle id maps to a [`tokio::sync::watch`] cell created lazily in
//! [`BundleState::Idle`]. Readers subscribe or snapshot freely; only the
//! engine task running the current attempt writes, and writes from a stale
//! attempt are ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::bundle::BundleId;
use crate::error::{Error, Result};
use crate::sink::StateSink;

/// Lifecycle state of one bundle.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum BundleState {
    /// Nothing has been requested yet, or the state was reset.
    #[default]
    Idle,
    /// An attempt is running.
    Downloading {
        /// Aggregate progress in `0.0..=1.0`, non-decreasing within an attempt.
        progress: f64,
        /// File currently being transferred.
        current_file: Option<String>,
        /// Files finished in this attempt.
        completed_count: usize,
        /// Files in this attempt.
        total_count: usize,
    },
    /// Every file of the last attempt is on disk and valid.
    Completed,
    /// The last attempt stopped at `failed_file`.
    Failed {
        /// Human-readable failure reason.
        error: String,
        /// File whose transfer failed.
        failed_file: String,
    },
    /// The last attempt was canceled.
    Canceled,
}

impl BundleState {
    /// Returns true while an attempt is running.
    #[must_use]
    pub const fn is_downloading(&self) -> bool {
        matches!(self, Self::Downloading { .. })
    }

    /// Returns true for `Completed`, `Failed` and `Canceled`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        match self {
            Self::Completed | Self::Failed { .. } | Self::Canceled => true,
            Self::Idle | Self::Downloading { .. } => false,
        }
    }

    /// Aggregate progress as a fraction.
    #[must_use]
    pub const fn progress(&self) -> f64 {
        match self {
            Self::Idle | Self::Failed { .. } | Self::Canceled => 0.0,
            Self::Downloading { progress, .. } => *progress,
            Self::Completed => 1.0,
        }
    }

    /// Short label for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Downloading { .. } => "downloading",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// Progress fraction of `completed` files plus a fraction of the current one.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn aggregate_progress(completed: usize, file_fraction: f64, total: usize) -> f64 {
    if total == 0 {
        return 1.0;
    }
    let fraction = file_fraction.clamp(0.0, 1.0);
    ((completed as f64 + fraction) / total as f64).clamp(0.0, 1.0)
}

struct StateCell {
    tx: watch::Sender<BundleState>,
    generation: u64,
}

impl StateCell {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(BundleState::Idle);
        Self { tx, generation: 0 }
    }
}

/// Owner of every bundle's state cell.
pub struct StateStore {
    cells: Mutex<HashMap<BundleId, StateCell>>,
    next_generation: AtomicU64,
    sink: Arc<dyn StateSink>,
}

impl StateStore {
    /// Creates an empty store that forwards every transition to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn StateSink>) -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            sink,
        }
    }

    fn cells(&self) -> MutexGuard<'_, HashMap<BundleId, StateCell>> {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state of a bundle, `Idle` if it was never referenced.
    #[must_use]
    pub fn current(&self, bundle_id: BundleId) -> BundleState {
        self.cells()
            .entry(bundle_id)
            .or_insert_with(StateCell::new)
            .tx
            .borrow()
            .clone()
    }

    /// Subscribes to a bundle's state. The receiver starts at the current value.
    #[must_use]
    pub fn subscribe(&self, bundle_id: BundleId) -> watch::Receiver<BundleState> {
        self.cells()
            .entry(bundle_id)
            .or_insert_with(StateCell::new)
            .tx
            .subscribe()
    }

    /// Snapshot of every bundle referenced so far, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(BundleId, BundleState)> {
        let mut states: Vec<_> = self
            .cells()
            .iter()
            .map(|(id, cell)| (*id, cell.tx.borrow().clone()))
            .collect();
        states.sort_by_key(|(id, _)| *id);
        states
    }

    /// Starts a new attempt, moving the bundle to `Downloading`.
    ///
    /// Returns the attempt generation the writer must present on updates.
    pub(crate) fn begin(&self, bundle_id: BundleId, total_count: usize) -> Result<u64> {
        let state = BundleState::Downloading {
            progress: 0.0,
            current_file: None,
            completed_count: 0,
            total_count,
        };
        let generation = {
            let mut cells = self.cells();
            let cell = cells.entry(bundle_id).or_insert_with(StateCell::new);
            if cell.tx.borrow().is_downloading() {
                return Err(Error::AlreadyDownloading(bundle_id));
            }
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            cell.generation = generation;
            cell.tx.send_replace(state.clone());
            generation
        };
        self.sink.publish(bundle_id, &state);
        Ok(generation)
    }

    /// Applies a transition from the attempt `generation`.
    ///
    /// Ignored unless that attempt is still current and the bundle is still
    /// `Downloading`. Progress never moves backwards within an attempt.
    pub(crate) fn update(&self, bundle_id: BundleId, generation: u64, next: BundleState) -> bool {
        let mut committed = None;
        if let Some(cell) = self.cells().get_mut(&bundle_id)
            && cell.generation == generation
        {
            cell.tx.send_if_modified(|current| {
                let BundleState::Downloading { progress: floor, .. } = *current else {
                    return false;
                };
                let next = match next {
                    BundleState::Downloading {
                        progress,
                        current_file,
                        completed_count,
                        total_count,
                    } => BundleState::Downloading {
                        progress: progress.clamp(floor, 1.0),
                        current_file,
                        completed_count,
                        total_count,
                    },
                    other => other,
                };
                if *current == next {
                    return false;
                }
                committed = Some(next.clone());
                *current = next;
                true
            });
        }
        self.publish(bundle_id, committed)
    }

    /// Moves a downloading bundle to `Canceled`. Returns false if it was not downloading.
    pub(crate) fn cancel(&self, bundle_id: BundleId) -> bool {
        let canceled = self.cells().get_mut(&bundle_id).is_some_and(|cell| {
            cell.tx.send_if_modified(|current| {
                if !current.is_downloading() {
                    return false;
                }
                *current = BundleState::Canceled;
                true
            })
        });
        self.publish(bundle_id, canceled.then_some(BundleState::Canceled))
    }

    /// Returns a bundle to `Idle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyDownloading`] while an attempt is running.
    pub fn reset(&self, bundle_id: BundleId) -> Result<()> {
        let reset = {
            let mut cells = self.cells();
            let cell = cells.entry(bundle_id).or_insert_with(StateCell::new);
            let current = cell.tx.borrow().clone();
            if current.is_downloading() {
                return Err(Error::AlreadyDownloading(bundle_id));
            }
            if current.is_terminal() {
                cell.tx.send_replace(BundleState::Idle);
            }
            current.is_terminal()
        };
        self.publish(bundle_id, reset.then_some(BundleState::Idle));
        Ok(())
    }

    /// Forwards a committed transition to the sink, outside the cell lock.
    fn publish(&self, bundle_id: BundleId, state: Option<BundleState>) -> bool {
        let Some(state) = state else {
            return false;
        };
        self.sink.publish(bundle_id, &state);
        true
    }
}

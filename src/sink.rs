//! Outbound notification of bundle state changes.
//!
//! The engine publishes every transition through a [`StateSink`]. Relaying
//! the change to other processes or users is the sink implementor's job;
//! delivery is best effort.

use tokio::sync::mpsc;

use crate::bundle::BundleId;
use crate::state::BundleState;

/// Receiver of bundle state transitions.
///
/// `publish` runs synchronously on the task that made the transition, after
/// the new state is visible to readers. Slow sinks delay that task only.
pub trait StateSink: Send + Sync {
    /// Called once for every state transition of `bundle_id`.
    fn publish(&self, bundle_id: BundleId, state: &BundleState);
}

/// A sink that ignores every transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSink;

impl StateSink for NoSink {
    fn publish(&self, _bundle_id: BundleId, _state: &BundleState) {}
}

/// A sink that logs transitions; progress updates go to `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl StateSink for LogSink {
    fn publish(&self, bundle_id: BundleId, state: &BundleState) {
        match state {
            BundleState::Downloading {
                progress,
                current_file,
                completed_count,
                total_count,
            } => log::debug!(
                "Bundle {bundle_id}: {completed_count}/{total_count} files, {:.1}% ({})",
                progress * 100.0,
                current_file.as_deref().unwrap_or("-"),
            ),
            BundleState::Failed { error, failed_file } => {
                log::warn!("Bundle {bundle_id} failed at {failed_file}: {error}");
            }
            BundleState::Idle | BundleState::Completed | BundleState::Canceled => {
                log::info!("Bundle {bundle_id} is now {}", state.label());
            }
        }
    }
}

/// One state transition as forwarded by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    /// Bundle whose state changed.
    pub bundle_id: BundleId,
    /// The new state.
    pub state: BundleState,
}

/// A sink forwarding transitions into an unbounded channel.
///
/// Once the receiver is dropped, transitions are discarded silently.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StateChange>,
}

impl ChannelSink {
    /// Creates a sink that sends on `tx`.
    #[must_use]
    pub const fn new(tx: mpsc::UnboundedSender<StateChange>) -> Self {
        Self { tx }
    }
}

impl StateSink for ChannelSink {
    fn publish(&self, bundle_id: BundleId, state: &BundleState) {
        let _ = self.tx.send(StateChange {
            bundle_id,
            state: state.clone(),
        });
    }
}

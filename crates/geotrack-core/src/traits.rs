//! Collaborator abstractions.
//!
//! The pipeline never talks to a platform location API directly. Position
//! fixes, activity hints and connectivity arrive through these traits so
//! that tests and the service binary can plug in their own sources.

use async_trait::async_trait;
use tokio::sync::watch;

use geotrack_types::RawFix;

use crate::motion::MotionHint;

/// Emits raw position fixes.
///
/// # Example
///
/// ```ignore
/// use geotrack_core::{PositionSource, Tracker};
///
/// async fn pump<S: PositionSource>(source: &mut S, tracker: &Tracker) {
///     while let Some(fix) = source.next_fix().await {
///         let _ = tracker.accept(fix).await;
///     }
/// }
/// ```
#[async_trait]
pub trait PositionSource: Send {
    /// The next fix, or `None` once the source is exhausted.
    async fn next_fix(&mut self) -> Option<RawFix>;

    /// Minimum travel in meters between fixes.
    ///
    /// Sources that cannot filter by distance ignore this.
    fn set_distance_filter(&mut self, _meters: f64) {}
}

/// Emits activity hints (moving / still).
#[async_trait]
pub trait MotionHintSource: Send {
    /// The next hint, or `None` once the source is exhausted.
    async fn next_hint(&mut self) -> Option<MotionHint>;
}

/// Coarse "network available" signal.
pub trait NetworkMonitor: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// [`NetworkMonitor`] whose state is set by the owner.
#[derive(Debug)]
pub struct NetworkSignal {
    sender: watch::Sender<bool>,
}

impl NetworkSignal {
    pub fn new(available: bool) -> Self {
        let (sender, _) = watch::channel(available);
        Self { sender }
    }

    pub fn set_available(&self, available: bool) {
        self.sender.send_if_modified(|current| {
            let changed = *current != available;
            *current = available;
            changed
        });
    }

    pub fn is_available(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for NetworkSignal {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkMonitor for NetworkSignal {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

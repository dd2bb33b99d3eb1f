//! Summary models returned by the store.

use serde::{Deserialize, Serialize};

/// Row counts for the queue, split by lock state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub total: u64,
    pub unlocked: u64,
    pub locked: u64,
}

impl QueueCounts {
    /// True when no row is owned by a sync cycle.
    pub fn all_unlocked(&self) -> bool {
        self.locked == 0
    }
}

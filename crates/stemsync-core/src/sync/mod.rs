//! Group transport and drift correction
//!
//! The [`SyncManager`] drives every track of a session as one transport,
//! reseeks independent players that drift apart and detects the natural end
//! of playback. It does no work on its own: the application loop calls
//! [`SyncManager::tick`] and the manager's poll timers decide what is due.

mod manager;
mod timer;

use serde::{Deserialize, Serialize};

pub use manager::{GroupState, SyncManager, TickOutcome};
pub use timer::PollTimer;

/// Drift correction and end detection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How often independent players are compared
    pub correction_interval_ms: u64,
    /// Drift beyond this is corrected by reseeking the straggler
    pub tolerance_ms: u64,
    /// How often the group is checked for natural completion
    pub end_poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            correction_interval_ms: 500,
            tolerance_ms: 300,
            end_poll_interval_ms: 200,
        }
    }
}

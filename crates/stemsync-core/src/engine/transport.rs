//! Virtual transport position
//!
//! The shared engine never asks the hardware where it is. Position is
//! derived from the monotonic clock:
//!
//! ```text
//! playing: clamp(offset + (now - started_at) * rate, 0, duration)
//! paused:  paused_position
//! stopped: 0
//! ended:   duration
//! ```

use std::time::Duration;

/// Transport state of the shared engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Stopped,
    Playing,
    Paused,
    /// Natural end of playback was detected
    Ended,
}

/// Immutable transport snapshot, swapped atomically on every transition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportSnapshot {
    pub state: TransportState,
    /// Clock reading when playback (re)started
    pub started_at: Duration,
    /// Media position at `started_at`
    pub offset_ms: u64,
    /// Authoritative position while paused
    pub paused_position_ms: u64,
    pub duration_ms: u64,
    pub rate: f64,
}

impl TransportSnapshot {
    pub fn stopped(duration_ms: u64) -> Self {
        Self {
            state: TransportState::Stopped,
            started_at: Duration::ZERO,
            offset_ms: 0,
            paused_position_ms: 0,
            duration_ms,
            rate: 1.0,
        }
    }

    pub fn playing(&self, now: Duration, offset_ms: u64) -> Self {
        Self {
            state: TransportState::Playing,
            started_at: now,
            offset_ms: offset_ms.min(self.duration_ms),
            paused_position_ms: 0,
            ..*self
        }
    }

    pub fn paused(&self, position_ms: u64) -> Self {
        Self {
            state: TransportState::Paused,
            paused_position_ms: position_ms.min(self.duration_ms),
            ..*self
        }
    }

    pub fn ended(&self) -> Self {
        Self {
            state: TransportState::Ended,
            paused_position_ms: self.duration_ms,
            ..*self
        }
    }

    pub fn with_duration(&self, duration_ms: u64) -> Self {
        Self {
            duration_ms,
            ..*self
        }
    }

    /// Media position at clock reading `now`
    pub fn position_ms(&self, now: Duration) -> u64 {
        match self.state {
            TransportState::Stopped => 0,
            TransportState::Paused => self.paused_position_ms.min(self.duration_ms),
            TransportState::Ended => self.duration_ms,
            TransportState::Playing => {
                let elapsed_ms = now.saturating_sub(self.started_at).as_secs_f64() * 1000.0;
                let position = self.offset_ms as f64 + elapsed_ms * self.rate;
                position.clamp(0.0, self.duration_ms as f64) as u64
            }
        }
    }
}

impl Default for TransportSnapshot {
    fn default() -> Self {
        Self::stopped(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playing_position_follows_clock() {
        let t = TransportSnapshot::stopped(10_000).playing(Duration::from_secs(5), 2_000);
        assert_eq!(t.position_ms(Duration::from_secs(5)), 2_000);
        assert_eq!(t.position_ms(Duration::from_millis(6_500)), 3_500);
        // Clock readings before the start never go negative
        assert_eq!(t.position_ms(Duration::from_secs(1)), 2_000);
    }

    #[test]
    fn test_position_clamps_to_duration() {
        let t = TransportSnapshot::stopped(10_000).playing(Duration::ZERO, 8_000);
        assert_eq!(t.position_ms(Duration::from_secs(60)), 10_000);
        assert_eq!(t.paused(25_000).position_ms(Duration::ZERO), 10_000);
    }

    #[test]
    fn test_rate_scales_elapsed_time() {
        let mut t = TransportSnapshot::stopped(10_000).playing(Duration::ZERO, 0);
        t.rate = 2.0;
        assert_eq!(t.position_ms(Duration::from_secs(3)), 6_000);
    }

    #[test]
    fn test_state_positions() {
        let t = TransportSnapshot::stopped(4_000);
        assert_eq!(t.position_ms(Duration::from_secs(9)), 0);
        assert_eq!(t.paused(1_234).position_ms(Duration::from_secs(9)), 1_234);
        assert_eq!(t.ended().position_ms(Duration::ZERO), 4_000);
    }
}

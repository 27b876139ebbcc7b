//! Cancellable fixed-interval poll timer

use std::time::Duration;

/// Fires at most once per interval when polled with the current time
#[derive(Debug, Clone)]
pub struct PollTimer {
    interval: Duration,
    next_due: Option<Duration>,
}

impl PollTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_due: None,
        }
    }

    /// Arm (or re-arm) the timer; the first firing is one interval after `now`
    pub fn start(&mut self, now: Duration) {
        self.next_due = Some(now + self.interval);
    }

    pub fn cancel(&mut self) {
        self.next_due = None;
    }

    pub fn is_armed(&self) -> bool {
        self.next_due.is_some()
    }

    /// True if the timer is due at `now`; schedules the next firing
    ///
    /// Missed intervals collapse into a single firing.
    pub fn fire_if_due(&mut self, now: Duration) -> bool {
        match self.next_due {
            Some(due) if now >= due => {
                self.next_due = Some(now + self.interval);
                true
            }
            _ => false,
        }
    }
}

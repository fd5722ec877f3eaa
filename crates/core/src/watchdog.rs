//! Inactivity Watchdog
//!
//! A liveness backstop: when nobody has spoken for a while and nothing is going
//! on, it nudges the scheduler by requesting an inactivity turn.

use crate::turn::TurnMachine;
use std::time::Duration;
use tokio::time::Instant;

/// Decides whether a poll should request an inactivity turn.
#[derive(Debug, Clone)]
pub struct InactivityWatchdog {
    poll_interval: Duration,
    threshold: Duration,
}

impl InactivityWatchdog {
    pub fn new(poll_interval: Duration, threshold: Duration) -> Self {
        Self {
            poll_interval,
            threshold,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// True when the user has been silent past the threshold, the machine is idle
    /// and unsuspended, and the session already asked its first question.
    pub fn should_fire(&self, now: Instant, last_activity: Instant, machine: &TurnMachine) -> bool {
        let silent_for = now.saturating_duration_since(last_activity);
        silent_for >= self.threshold
            && machine.state().is_idle()
            && machine.suspended().is_none()
            && machine.initial_question_asked()
    }
}

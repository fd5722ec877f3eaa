//! Session Timing Configuration
//!
//! Every timer the orchestration core waits on lives here, so a service can tune a
//! session once at start-up and tests can shrink or stretch any of them.

use std::time::Duration;

/// Timings that govern a single study session.
///
/// Values are fixed for the lifetime of the session; the pomodoro durations in
/// particular are read once when the session starts.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Wait before the very first proactive question is generated.
    pub initial_delay: Duration,
    /// Capture cap for a reply to a proactive question.
    pub reply_capture_limit: Duration,
    /// Lower bound of the display hold after a proactive conclusion.
    pub proactive_hold_min: Duration,
    /// Per-character hold after a proactive conclusion.
    pub proactive_hold_per_char: Duration,
    /// Lower bound of the display hold after a user-initiated answer.
    pub answer_hold_min: Duration,
    /// Per-character hold after a user-initiated answer.
    pub answer_hold_per_char: Duration,
    /// Grace added after a topic summary lands before the next proactive cycle.
    pub topic_grace: Duration,
    /// Grace after a user-initiated exchange before the scheduler re-arms.
    pub user_grace: Duration,
    /// How often the inactivity watchdog polls.
    pub watchdog_poll: Duration,
    /// Silence threshold after which the watchdog requests a turn.
    pub inactivity_threshold: Duration,
    /// Length of a study phase.
    pub study_duration: Duration,
    /// Length of a break phase.
    pub break_duration: Duration,
    /// Identical text is not synthesized twice within this window.
    pub duplicate_speech_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            reply_capture_limit: Duration::from_secs(5),
            proactive_hold_min: Duration::from_secs(8),
            proactive_hold_per_char: Duration::from_millis(80),
            answer_hold_min: Duration::from_secs(12),
            answer_hold_per_char: Duration::from_millis(100),
            topic_grace: Duration::from_secs(15),
            user_grace: Duration::from_secs(3),
            watchdog_poll: Duration::from_secs(10),
            inactivity_threshold: Duration::from_secs(60),
            study_duration: Duration::from_secs(25 * 60),
            break_duration: Duration::from_secs(5 * 60),
            duplicate_speech_window: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Overrides the pomodoro durations, keeping every other timing.
    pub fn with_pomodoro(mut self, study: Duration, rest: Duration) -> Self {
        self.study_duration = study;
        self.break_duration = rest;
        self
    }

    /// Display hold for the final line of a proactive topic.
    pub fn proactive_hold(&self, text: &str) -> Duration {
        display_hold(text, self.proactive_hold_min, self.proactive_hold_per_char)
    }

    /// Display hold for an answer to a user-initiated question.
    pub fn answer_hold(&self, text: &str) -> Duration {
        display_hold(text, self.answer_hold_min, self.answer_hold_per_char)
    }
}

fn display_hold(text: &str, min: Duration, per_char: Duration) -> Duration {
    let chars = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
    min.max(per_char.saturating_mul(chars))
}

//! Pomodoro Interrupt Coordinator
//!
//! Counts study and break phases and reports each phase change. The session
//! runtime turns a change into a suspension of the turn machine plus an
//! announcement that takes priority over any other speech.

use serde::Serialize;
use std::time::Duration;

pub const BREAK_ANNOUNCEMENT: &str = "Time for a break! Stretch, hydrate, and rest your eyes.";
pub const STUDY_ANNOUNCEMENT: &str = "Break is over. Let's get back to studying!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PomodoroPhase {
    Study,
    Break,
}

/// A phase boundary crossed during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseChange {
    /// A study phase completed; `completed_sessions` includes this one.
    BreakStarted { completed_sessions: u32 },
    StudyResumed,
}

impl PhaseChange {
    pub fn announcement(&self) -> &'static str {
        match self {
            PhaseChange::BreakStarted { .. } => BREAK_ANNOUNCEMENT,
            PhaseChange::StudyResumed => STUDY_ANNOUNCEMENT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PomodoroCoordinator {
    phase: PomodoroPhase,
    elapsed: Duration,
    study: Duration,
    rest: Duration,
    completed_sessions: u32,
}

impl PomodoroCoordinator {
    /// Starts in the study phase. Durations are fixed for the coordinator's life.
    pub fn new(study: Duration, rest: Duration) -> Self {
        Self {
            phase: PomodoroPhase::Study,
            elapsed: Duration::ZERO,
            study,
            rest,
            completed_sessions: 0,
        }
    }

    pub fn phase(&self) -> PomodoroPhase {
        self.phase
    }

    pub fn completed_sessions(&self) -> u32 {
        self.completed_sessions
    }

    pub fn remaining(&self) -> Duration {
        self.current_duration().saturating_sub(self.elapsed)
    }

    fn current_duration(&self) -> Duration {
        match self.phase {
            PomodoroPhase::Study => self.study,
            PomodoroPhase::Break => self.rest,
        }
    }

    /// Advances the clock by `dt`, reporting at most one phase change per tick.
    ///
    /// Overshoot does not carry into the next phase.
    pub fn tick(&mut self, dt: Duration) -> Option<PhaseChange> {
        self.elapsed += dt;
        if self.elapsed < self.current_duration() {
            return None;
        }
        self.elapsed = Duration::ZERO;
        match self.phase {
            PomodoroPhase::Study => {
                self.phase = PomodoroPhase::Break;
                self.completed_sessions += 1;
                Some(PhaseChange::BreakStarted {
                    completed_sessions: self.completed_sessions,
                })
            }
            PomodoroPhase::Break => {
                self.phase = PomodoroPhase::Study;
                Some(PhaseChange::StudyResumed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn test_study_then_break_then_study() {
        let mut pomodoro = PomodoroCoordinator::new(Duration::from_secs(3), Duration::from_secs(2));
        assert_eq!(pomodoro.tick(SECOND), None);
        assert_eq!(pomodoro.tick(SECOND), None);
        assert_eq!(
            pomodoro.tick(SECOND),
            Some(PhaseChange::BreakStarted {
                completed_sessions: 1
            })
        );
        assert_eq!(pomodoro.phase(), PomodoroPhase::Break);
        assert_eq!(pomodoro.remaining(), Duration::from_secs(2));

        assert_eq!(pomodoro.tick(SECOND), None);
        assert_eq!(pomodoro.tick(SECOND), Some(PhaseChange::StudyResumed));
        assert_eq!(pomodoro.phase(), PomodoroPhase::Study);
    }

    #[test]
    fn test_completed_sessions_count_only_study_phases() {
        let mut pomodoro = PomodoroCoordinator::new(SECOND, SECOND);
        let mut breaks = 0;
        for _ in 0..6 {
            if let Some(PhaseChange::BreakStarted { .. }) = pomodoro.tick(SECOND) {
                breaks += 1;
            }
        }
        assert_eq!(breaks, 3);
        assert_eq!(pomodoro.completed_sessions(), 3);
    }

    #[test]
    fn test_announcements_match_phase() {
        assert_eq!(PhaseChange::StudyResumed.announcement(), STUDY_ANNOUNCEMENT);
        assert_eq!(
            PhaseChange::BreakStarted {
                completed_sessions: 1
            }
            .announcement(),
            BREAK_ANNOUNCEMENT
        );
    }
}

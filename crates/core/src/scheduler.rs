//! Proactive Question Scheduler
//!
//! The gateway picks *what* to ask; the scheduler decides *when* a proposal may be
//! requested and makes sure a decision is revealed at most once, and only for the
//! cycle that asked for it.

use crate::turn::{Epoch, TurnMachine};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest the model may hold a question back before it is shown.
pub const MAX_REVEAL_DELAY: Duration = Duration::from_secs(30);

/// The gateway's answer to "what should I ask next?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerDecision {
    /// Pre-display wait before the question is shown and spoken.
    #[serde(alias = "delay", alias = "delaySeconds")]
    pub delay_seconds: u64,
    /// Number of the question from the material this targets, if any.
    #[serde(default, alias = "targetId", alias = "target_id", alias = "targetTopicId")]
    pub target_topic_id: Option<String>,
    pub question: String,
}

impl SchedulerDecision {
    /// The pre-display wait, capped at [`MAX_REVEAL_DELAY`].
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_seconds).min(MAX_REVEAL_DELAY)
    }
}

/// Holds the single outstanding decision and the single re-arm deadline.
#[derive(Debug, Default)]
pub struct ProactiveScheduler {
    pending: Option<(Epoch, SchedulerDecision)>,
    arm_generation: u64,
    armed: bool,
}

impl ProactiveScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A proposal may only be requested from an idle, unsuspended machine.
    pub fn may_request(&self, machine: &TurnMachine) -> bool {
        machine.state().is_idle() && machine.suspended().is_none()
    }

    /// Withholds a fresh decision for its pre-display delay.
    pub fn withhold(&mut self, epoch: Epoch, decision: SchedulerDecision) -> Duration {
        let delay = decision.delay();
        if let Some((stale, _)) = self.pending.replace((epoch, decision)) {
            tracing::debug!(epoch = stale, "Replacing an unrevealed decision");
        }
        delay
    }

    /// Hands out the decision for `epoch`, consuming it.
    ///
    /// A decision belonging to any other epoch is dropped and never returned.
    pub fn reveal(&mut self, epoch: Epoch) -> Option<SchedulerDecision> {
        match self.pending.take() {
            Some((pending_epoch, decision)) if pending_epoch == epoch => Some(decision),
            Some((pending_epoch, decision)) => {
                tracing::debug!(
                    pending_epoch,
                    epoch,
                    question = %decision.question,
                    "Dropping decision from a superseded cycle"
                );
                None
            }
            None => None,
        }
    }

    /// Throws away any unrevealed decision, returning it for logging.
    pub fn discard(&mut self) -> Option<SchedulerDecision> {
        self.pending.take().map(|(_, decision)| decision)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Arms the scheduler for one request. Any earlier arm is superseded.
    pub fn arm(&mut self) -> u64 {
        self.arm_generation += 1;
        self.armed = true;
        self.arm_generation
    }

    pub fn disarm(&mut self) {
        self.arm_generation += 1;
        self.armed = false;
    }

    /// Consumes the arm if `generation` is still the latest one.
    pub fn fire(&mut self, generation: u64) -> bool {
        if generation == self.arm_generation && self.armed {
            self.armed = false;
            true
        } else {
            false
        }
    }
}

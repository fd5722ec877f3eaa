//! Turn State Machine
//!
//! The single source of truth for whose turn it is. Every trigger (scheduler,
//! watchdog, press-to-talk) goes through [`TurnMachine::request_turn`]; every
//! asynchronous completion proves it is still relevant by presenting the epoch it
//! was started under.

use serde::Serialize;
use std::fmt;

/// Monotonic counter identifying one admitted turn. Bumped on every accepted
/// request and every abort, so results from an older epoch are stale.
pub type Epoch = u64;

/// Who started the turn that is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOrigin {
    Proactive,
    UserInitiated,
}

/// The trigger asking for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Proactive,
    UserInitiated,
    Inactivity,
}

/// Why the machine is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendReason {
    Break,
}

/// What is happening right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "origin", rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    AwaitingInitialDelay,
    Generating(TurnOrigin),
    /// A proactive question is ready but withheld for its pre-display delay.
    AwaitingReveal,
    Speaking(TurnOrigin),
    AwaitingUserReply,
    Listening(TurnOrigin),
    Transcribing(TurnOrigin),
    /// The final line stays on screen before the machine goes idle.
    Holding(TurnOrigin),
}

impl TurnState {
    /// The origin of the turn in progress, `None` when idle.
    pub fn origin(&self) -> Option<TurnOrigin> {
        match self {
            TurnState::Idle => None,
            TurnState::AwaitingInitialDelay
            | TurnState::AwaitingReveal
            | TurnState::AwaitingUserReply => Some(TurnOrigin::Proactive),
            TurnState::Generating(o)
            | TurnState::Speaking(o)
            | TurnState::Listening(o)
            | TurnState::Transcribing(o)
            | TurnState::Holding(o) => Some(*o),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, TurnState::Idle)
    }

    /// True for the mutually exclusive activities: listening, transcribing,
    /// generating and speaking.
    pub fn is_exclusive_activity(&self) -> bool {
        matches!(
            self,
            TurnState::Listening(_)
                | TurnState::Transcribing(_)
                | TurnState::Generating(_)
                | TurnState::Speaking(_)
        )
    }

    fn can_advance_to(&self, next: &TurnState) -> bool {
        use TurnOrigin::*;
        use TurnState::*;
        match (self, next) {
            (AwaitingInitialDelay, Generating(Proactive)) => true,
            (Generating(Proactive), AwaitingReveal) => true,
            (AwaitingReveal, Speaking(Proactive)) => true,
            (Generating(a), Speaking(b)) => a == b,
            (Speaking(Proactive), AwaitingUserReply) => true,
            (Speaking(a), Holding(b)) => a == b,
            (AwaitingUserReply, Listening(Proactive)) => true,
            (Listening(a), Transcribing(b)) => a == b,
            (Transcribing(a), Generating(b)) => a == b,
            // Failure paths jump straight to the fallback utterance.
            (Listening(a), Speaking(b)) | (Transcribing(a), Speaking(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnState::Idle => write!(f, "Idle"),
            TurnState::AwaitingInitialDelay => write!(f, "AwaitingInitialDelay"),
            TurnState::AwaitingReveal => write!(f, "AwaitingReveal"),
            TurnState::AwaitingUserReply => write!(f, "AwaitingUserReply"),
            TurnState::Generating(o) => write!(f, "Generating({o:?})"),
            TurnState::Speaking(o) => write!(f, "Speaking({o:?})"),
            TurnState::Listening(o) => write!(f, "Listening({o:?})"),
            TurnState::Transcribing(o) => write!(f, "Transcribing({o:?})"),
            TurnState::Holding(o) => write!(f, "Holding({o:?})"),
        }
    }
}

/// Why a turn request was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TurnRejection {
    #[error("a turn is already in progress ({0})")]
    Busy(TurnState),
    #[error("proactive turns are suspended during a break")]
    Suspended,
    #[error("a user question is already in progress")]
    AlreadyUserTurn,
}

/// A transition that could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("epoch {presented} is stale (current is {current})")]
    Stale { presented: Epoch, current: Epoch },
    #[error("invalid transition from {from} to {to}")]
    Invalid { from: TurnState, to: TurnState },
}

/// An admitted turn request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub epoch: Epoch,
    pub state: TurnState,
    /// The proactive state that was cut short by a user request.
    pub preempted: Option<TurnState>,
}

/// The turn state machine. Owned by exactly one session task.
#[derive(Debug, Clone)]
pub struct TurnMachine {
    state: TurnState,
    suspended: Option<SuspendReason>,
    epoch: Epoch,
    initial_question_asked: bool,
}

impl Default for TurnMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnMachine {
    pub fn new() -> Self {
        Self {
            state: TurnState::Idle,
            suspended: None,
            epoch: 0,
            initial_question_asked: false,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn suspended(&self) -> Option<SuspendReason> {
        self.suspended
    }

    pub fn initial_question_asked(&self) -> bool {
        self.initial_question_asked
    }

    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.epoch == epoch
    }

    /// Admits or rejects a turn request.
    ///
    /// Proactive and inactivity requests need an idle, unsuspended machine. A user
    /// request is also admitted in the middle of a proactive cycle that has not
    /// reached its final hold, preempting it; breaks do not block the user.
    pub fn request_turn(&mut self, kind: TurnKind) -> Result<Accepted, TurnRejection> {
        match kind {
            TurnKind::Proactive | TurnKind::Inactivity => {
                if self.suspended.is_some() {
                    return Err(TurnRejection::Suspended);
                }
                if !self.state.is_idle() {
                    return Err(TurnRejection::Busy(self.state));
                }
                let next = if self.initial_question_asked {
                    TurnState::Generating(TurnOrigin::Proactive)
                } else {
                    TurnState::AwaitingInitialDelay
                };
                Ok(self.admit(next, None))
            }
            TurnKind::UserInitiated => {
                let preempted = match self.state {
                    TurnState::Idle => None,
                    TurnState::Holding(TurnOrigin::Proactive) => {
                        return Err(TurnRejection::Busy(self.state));
                    }
                    state if state.origin() == Some(TurnOrigin::UserInitiated) => {
                        return Err(TurnRejection::AlreadyUserTurn);
                    }
                    state => Some(state),
                };
                Ok(self.admit(TurnState::Listening(TurnOrigin::UserInitiated), preempted))
            }
        }
    }

    fn admit(&mut self, next: TurnState, preempted: Option<TurnState>) -> Accepted {
        self.epoch += 1;
        self.state = next;
        Accepted {
            epoch: self.epoch,
            state: next,
            preempted,
        }
    }

    /// Moves the turn started under `epoch` to its next state.
    pub fn advance(&mut self, epoch: Epoch, next: TurnState) -> Result<(), TransitionError> {
        if epoch != self.epoch {
            return Err(TransitionError::Stale {
                presented: epoch,
                current: self.epoch,
            });
        }
        if !self.state.can_advance_to(&next) {
            return Err(TransitionError::Invalid {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Ends a held turn and returns to idle.
    pub fn finish(&mut self, epoch: Epoch) -> Result<(), TransitionError> {
        if epoch != self.epoch {
            return Err(TransitionError::Stale {
                presented: epoch,
                current: self.epoch,
            });
        }
        if !matches!(self.state, TurnState::Holding(_)) {
            return Err(TransitionError::Invalid {
                from: self.state,
                to: TurnState::Idle,
            });
        }
        self.state = TurnState::Idle;
        Ok(())
    }

    /// Abandons whatever turn is running. Every outstanding epoch becomes stale.
    pub fn abort(&mut self) -> TurnState {
        let previous = self.state;
        self.epoch += 1;
        self.state = TurnState::Idle;
        previous
    }

    pub fn mark_initial_question_asked(&mut self) {
        self.initial_question_asked = true;
    }

    pub fn suspend(&mut self, reason: SuspendReason) {
        self.suspended = Some(reason);
    }

    pub fn resume(&mut self) {
        self.suspended = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn machine_in(states: &[TurnState]) -> (TurnMachine, Epoch) {
        let mut machine = TurnMachine::new();
        machine.mark_initial_question_asked();
        let epoch = machine.request_turn(TurnKind::Proactive).unwrap().epoch;
        for state in states {
            machine.advance(epoch, *state).unwrap();
        }
        (machine, epoch)
    }

    #[test]
    fn test_first_proactive_cycle_waits_for_initial_delay() {
        let mut machine = TurnMachine::new();
        let accepted = machine.request_turn(TurnKind::Proactive).unwrap();
        assert_eq!(accepted.state, TurnState::AwaitingInitialDelay);
        assert_eq!(accepted.preempted, None);
    }

    #[test]
    fn test_later_cycles_generate_immediately() {
        let mut machine = TurnMachine::new();
        machine.mark_initial_question_asked();
        let accepted = machine.request_turn(TurnKind::Inactivity).unwrap();
        assert_eq!(accepted.state, TurnState::Generating(TurnOrigin::Proactive));
    }

    #[test]
    fn test_second_proactive_request_is_rejected_while_busy() {
        let mut machine = TurnMachine::new();
        machine.request_turn(TurnKind::Proactive).unwrap();
        assert_eq!(
            machine.request_turn(TurnKind::Inactivity),
            Err(TurnRejection::Busy(TurnState::AwaitingInitialDelay))
        );
    }

    #[test]
    fn test_user_request_preempts_pending_reveal() {
        let (mut machine, epoch) = machine_in(&[TurnState::AwaitingReveal]);
        let accepted = machine.request_turn(TurnKind::UserInitiated).unwrap();

        assert_eq!(accepted.preempted, Some(TurnState::AwaitingReveal));
        assert_eq!(
            machine.state(),
            TurnState::Listening(TurnOrigin::UserInitiated)
        );
        assert!(!machine.is_current(epoch));
        assert!(matches!(
            machine.advance(epoch, TurnState::Speaking(TurnOrigin::Proactive)),
            Err(TransitionError::Stale { .. })
        ));
    }

    #[test]
    fn test_user_request_rejected_during_final_hold() {
        let (mut machine, _) = machine_in(&[
            TurnState::Speaking(TurnOrigin::Proactive),
            TurnState::Holding(TurnOrigin::Proactive),
        ]);
        assert!(matches!(
            machine.request_turn(TurnKind::UserInitiated),
            Err(TurnRejection::Busy(_))
        ));
    }

    #[test]
    fn test_user_request_rejected_during_user_turn() {
        let mut machine = TurnMachine::new();
        machine.request_turn(TurnKind::UserInitiated).unwrap();
        assert_eq!(
            machine.request_turn(TurnKind::UserInitiated),
            Err(TurnRejection::AlreadyUserTurn)
        );
    }

    #[test]
    fn test_break_blocks_proactive_but_not_user() {
        let mut machine = TurnMachine::new();
        machine.suspend(SuspendReason::Break);

        assert_eq!(
            machine.request_turn(TurnKind::Proactive),
            Err(TurnRejection::Suspended)
        );
        assert_eq!(
            machine.request_turn(TurnKind::Inactivity),
            Err(TurnRejection::Suspended)
        );
        assert!(machine.request_turn(TurnKind::UserInitiated).is_ok());

        let mut machine = TurnMachine::new();
        machine.suspend(SuspendReason::Break);
        machine.resume();
        assert!(machine.request_turn(TurnKind::Proactive).is_ok());
    }

    #[test]
    fn test_invalid_transition_is_refused() {
        let (mut machine, epoch) = machine_in(&[]);
        assert!(matches!(
            machine.advance(epoch, TurnState::Listening(TurnOrigin::Proactive)),
            Err(TransitionError::Invalid { .. })
        ));
        assert_eq!(
            machine.state(),
            TurnState::Generating(TurnOrigin::Proactive)
        );
    }

    #[test]
    fn test_finish_only_from_hold() {
        let (mut machine, epoch) = machine_in(&[TurnState::Speaking(TurnOrigin::Proactive)]);
        assert!(machine.finish(epoch).is_err());
        machine
            .advance(epoch, TurnState::Holding(TurnOrigin::Proactive))
            .unwrap();
        assert!(machine.finish(epoch).is_ok());
        assert!(machine.state().is_idle());
    }

    #[test]
    fn test_abort_invalidates_epoch() {
        let (mut machine, epoch) = machine_in(&[TurnState::AwaitingReveal]);
        assert_eq!(machine.abort(), TurnState::AwaitingReveal);
        assert!(machine.state().is_idle());
        assert!(machine.finish(epoch).is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Request(TurnKind),
        Step,
        Abort,
        Suspend,
        Resume,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Request(TurnKind::Proactive)),
            Just(Op::Request(TurnKind::Inactivity)),
            Just(Op::Request(TurnKind::UserInitiated)),
            Just(Op::Step),
            Just(Op::Abort),
            Just(Op::Suspend),
            Just(Op::Resume),
        ]
    }

    /// Walks the happy path one state at a time.
    fn next_state(state: TurnState) -> Option<TurnState> {
        use TurnOrigin::*;
        match state {
            TurnState::AwaitingInitialDelay => Some(TurnState::Generating(Proactive)),
            TurnState::Generating(Proactive) => Some(TurnState::AwaitingReveal),
            TurnState::AwaitingReveal => Some(TurnState::Speaking(Proactive)),
            TurnState::Speaking(Proactive) => Some(TurnState::AwaitingUserReply),
            TurnState::AwaitingUserReply => Some(TurnState::Listening(Proactive)),
            TurnState::Listening(o) => Some(TurnState::Transcribing(o)),
            TurnState::Transcribing(o) => Some(TurnState::Generating(o)),
            TurnState::Generating(UserInitiated) => Some(TurnState::Speaking(UserInitiated)),
            TurnState::Speaking(UserInitiated) => Some(TurnState::Holding(UserInitiated)),
            _ => None,
        }
    }

    proptest! {
        #[test]
        fn prop_at_most_one_turn_admitted_while_busy(ops in prop::collection::vec(arb_op(), 1..64)) {
            let mut machine = TurnMachine::new();
            for op in ops {
                let before = machine.state();
                let epoch = machine.epoch();
                match op {
                    Op::Request(kind) => {
                        let result = machine.request_turn(kind);
                        match (kind, result) {
                            (TurnKind::UserInitiated, Ok(accepted)) => {
                                // A user request only ever cuts into an unfinished proactive cycle.
                                prop_assert!(before.is_idle() || (before.origin() == Some(TurnOrigin::Proactive)
                                    && !matches!(before, TurnState::Holding(_))));
                                prop_assert_eq!(accepted.epoch, epoch + 1);
                            }
                            (_, Ok(_)) => {
                                prop_assert!(before.is_idle());
                                prop_assert!(machine.suspended().is_none());
                            }
                            (_, Err(_)) => {
                                prop_assert_eq!(machine.state(), before);
                                prop_assert_eq!(machine.epoch(), epoch);
                            }
                        }
                    }
                    Op::Step => {
                        if let TurnState::Holding(_) = before {
                            prop_assert!(machine.finish(epoch).is_ok());
                        } else if let Some(next) = next_state(before) {
                            prop_assert!(machine.advance(epoch, next).is_ok());
                        }
                    }
                    Op::Abort => {
                        machine.abort();
                        prop_assert!(machine.state().is_idle());
                    }
                    Op::Suspend => machine.suspend(SuspendReason::Break),
                    Op::Resume => machine.resume(),
                }
                // Stale epochs can never move the machine.
                if machine.epoch() != epoch {
                    prop_assert!(machine.advance(epoch, TurnState::Idle).is_err());
                }
            }
        }
    }
}

use crate::pomodoro::PomodoroPhase;
use crate::turn::{SuspendReason, TurnState};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Ai,
    User,
}

/// Events a running session emits for whatever is presenting it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The turn machine moved, or its suspension changed.
    StateChanged {
        state: TurnState,
        suspended: Option<SuspendReason>,
    },
    /// A proactive question is now visible.
    QuestionShown {
        target_topic_id: Option<String>,
        question: String,
    },
    /// The visible proactive question was taken down.
    QuestionHidden,
    /// A line said by either side, for captions and transcripts.
    Utterance { speaker: Speaker, text: String },
    TopicConcluded { summary: String },
    PhaseChanged { phase: PomodoroPhase },
    /// One study phase completed. Emitted once per Study→Break transition.
    SessionCompleted { completed_sessions: u32 },
    /// Something the user should know about but that does not stop the session.
    Notice { message: String },
}

//! Defines the WebSocket message protocol between the browser client and the API server.
//!
//! Besides carrying session events to the page, the socket doubles as the audio
//! device: the server asks the browser to speak or record with an `id`, and the
//! browser answers with the same `id` once it is done.

use serde::{Deserialize, Serialize};
use study_buddy_core::{
    SessionEvent, Speaker, TurnState,
    gateway::Question,
    pomodoro::PomodoroPhase,
    turn::SuspendReason,
};
use uuid::Uuid;

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Starts the study session. This must be the first message.
    Init {
        /// Questions extracted from the study material.
        questions: Vec<Question>,
        study_minutes: Option<u64>,
        break_minutes: Option<u64>,
    },
    /// Press-to-talk pressed.
    BeginUserQuestion,
    /// Press-to-talk released.
    StopUserQuestion,
    CancelUserQuestion,
    /// Playback of a `speak` request finished.
    SpeechEnded { id: u64 },
    /// Recording of a `start_capture` request finished.
    CaptureComplete {
        id: u64,
        audio_base64: String,
        mime_type: String,
    },
    /// Recording could not happen at all.
    CaptureFailed { id: u64, reason: CaptureFailure },
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaptureFailure {
    PermissionDenied,
    Unavailable,
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms the session is running.
    Initialized { session_id: Uuid },
    StateUpdate {
        state: TurnState,
        suspended: Option<SuspendReason>,
    },
    QuestionShown {
        target_topic_id: Option<String>,
        question: String,
    },
    QuestionHidden,
    /// A caption line.
    Utterance { speaker: Speaker, text: String },
    /// Asks the browser to say `text` and reply with `speech_ended`.
    Speak { id: u64, text: String },
    StopSpeaking { id: u64 },
    /// Asks the browser to record, for at most `max_ms` when given.
    StartCapture { id: u64, max_ms: Option<u64> },
    /// Asks the browser to end a recording and send what it has.
    StopCapture { id: u64 },
    /// Asks the browser to end a recording and drop it unsent.
    DiscardCapture { id: u64 },
    TopicConcluded { summary: String },
    PhaseChanged { phase: PomodoroPhase },
    SessionCompleted { completed_sessions: u32 },
    Notice { message: String },
    /// Reports a fatal error to the client.
    Error { message: String },
}

impl From<SessionEvent> for ServerMessage {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::StateChanged { state, suspended } => {
                ServerMessage::StateUpdate { state, suspended }
            }
            SessionEvent::QuestionShown {
                target_topic_id,
                question,
            } => ServerMessage::QuestionShown {
                target_topic_id,
                question,
            },
            SessionEvent::QuestionHidden => ServerMessage::QuestionHidden,
            SessionEvent::Utterance { speaker, text } => ServerMessage::Utterance { speaker, text },
            SessionEvent::TopicConcluded { summary } => ServerMessage::TopicConcluded { summary },
            SessionEvent::PhaseChanged { phase } => ServerMessage::PhaseChanged { phase },
            SessionEvent::SessionCompleted { completed_sessions } => {
                ServerMessage::SessionCompleted { completed_sessions }
            }
            SessionEvent::Notice { message } => ServerMessage::Notice { message },
        }
    }
}

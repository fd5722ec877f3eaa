//! Study Session
//!
//! A study session is one tokio task that owns the turn machine, the ledger, the
//! topic memory, the scheduler, the watchdog and the pomodoro clock. Nothing else
//! mutates them; callers talk to the task through a [`SessionHandle`] and listen to
//! the [`SessionEvent`] stream it returns.

mod runtime;

pub use runtime::FALLBACK_UTTERANCE;

use crate::config::SessionConfig;
use crate::events::SessionEvent;
use crate::gateway::{AiGateway, QuestionSet};
use crate::memory::ConversationTurn;
use crate::pomodoro::PomodoroPhase;
use crate::speech::SpeechPipeline;
use crate::turn::{Accepted, SuspendReason, TurnKind, TurnRejection, TurnState};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

/// Commands accepted by the session task.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    RequestTurn {
        kind: TurnKind,
        reply: oneshot::Sender<Result<Accepted, TurnRejection>>,
    },
    StopUserQuestion,
    CancelUserQuestion,
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a study session needs at least one question")]
    NoQuestions,
    #[error("the study session has ended")]
    Closed,
}

/// Counters kept for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    /// Proactive cycles started. Never decremented.
    pub conversation_count: u64,
    /// Study→Break transitions so far.
    pub completed_session_count: u32,
}

/// A point-in-time view of a session, for status endpoints and tests.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: TurnState,
    pub suspended: Option<SuspendReason>,
    pub phase: PomodoroPhase,
    pub phase_remaining_secs: u64,
    pub counters: SessionCounters,
    pub seconds_since_activity: u64,
    pub ledger: Vec<ConversationTurn>,
    pub topic_summaries: Vec<String>,
    pub decision_pending: bool,
}

/// A cheap, clonable handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Asks the turn machine for a turn of the given kind.
    pub async fn request_turn(&self, kind: TurnKind) -> Result<Result<Accepted, TurnRejection>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::RequestTurn { kind, reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Press-to-talk: starts an open-ended capture for a user question.
    pub async fn begin_user_question(&self) -> Result<Result<Accepted, TurnRejection>, SessionError> {
        self.request_turn(TurnKind::UserInitiated).await
    }

    /// Ends the capture of a user question and lets it be answered.
    pub async fn stop_user_question(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::StopUserQuestion).await
    }

    /// Drops a user question before it is transcribed.
    pub async fn cancel_user_question(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::CancelUserQuestion).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(reply)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Shutdown).await
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

/// Entry point for starting study sessions.
pub struct StudySession;

impl StudySession {
    /// Spawns the session task.
    ///
    /// The session stays inert until it has material: an empty question set is
    /// refused. The first proactive cycle is requested as soon as the task runs.
    pub fn start(
        config: SessionConfig,
        questions: QuestionSet,
        gateway: Arc<dyn AiGateway>,
        speech: Arc<dyn SpeechPipeline>,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        if questions.is_empty() {
            return Err(SessionError::NoQuestions);
        }

        let (command_tx, command_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let runtime = runtime::SessionRuntime::new(config, questions, gateway, speech, event_tx);

        let span = tracing::info_span!("study_session");
        tokio::spawn(runtime.run(command_rx).instrument(span));

        Ok((SessionHandle { commands: command_tx }, event_rx))
    }
}

//! API Models
//!
//! Request and response bodies of the REST surface, with `utoipa` schemas. Core
//! types are mapped into these rather than exposed directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use study_buddy_core::{QuestionSet, SessionSnapshot, pomodoro::PomodoroPhase};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Deserialize, ToSchema)]
pub struct ExtractQuestionsPayload {
    /// The page of study material, base64-encoded. A `data:` URL is accepted too.
    pub image_base64: String,
    #[schema(example = "image/png")]
    pub mime_type: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct QuestionItem {
    #[schema(example = "4")]
    pub number: String,
    #[schema(example = "Explain how a binary heap keeps its shape.")]
    pub text: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ExtractedQuestions {
    pub questions: Vec<QuestionItem>,
}

impl From<QuestionSet> for ExtractedQuestions {
    fn from(set: QuestionSet) -> Self {
        Self {
            questions: set
                .questions
                .into_iter()
                .map(|q| QuestionItem {
                    number: q.number,
                    text: q.text,
                })
                .collect(),
        }
    }
}

/// A point-in-time view of a live study session.
#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct SessionStatus {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    #[schema(example = "Listening(Proactive)")]
    pub state: String,
    pub on_break: bool,
    #[schema(example = "study")]
    pub phase: String,
    pub phase_remaining_secs: u64,
    pub conversation_count: u64,
    pub completed_session_count: u32,
    pub seconds_since_activity: u64,
    pub topic_summaries: Vec<String>,
    /// Exchanges in the topic currently being discussed.
    pub open_turns: usize,
}

impl SessionStatus {
    pub fn from_snapshot(id: Uuid, started_at: DateTime<Utc>, snapshot: SessionSnapshot) -> Self {
        Self {
            id,
            started_at,
            state: snapshot.state.to_string(),
            on_break: snapshot.suspended.is_some(),
            phase: match snapshot.phase {
                PomodoroPhase::Study => "study".to_string(),
                PomodoroPhase::Break => "break".to_string(),
            },
            phase_remaining_secs: snapshot.phase_remaining_secs,
            conversation_count: snapshot.counters.conversation_count,
            completed_session_count: snapshot.counters.completed_session_count,
            seconds_since_activity: snapshot.seconds_since_activity,
            topic_summaries: snapshot.topic_summaries,
            open_turns: snapshot.ledger.len(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

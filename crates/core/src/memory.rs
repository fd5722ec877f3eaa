//! Conversation Ledger and Topic Memory
//!
//! The ledger holds the turn-pairs of the topic currently under discussion; the
//! topic memory holds one-line summaries of topics that already concluded so the
//! scheduler can steer away from them.

use serde::{Deserialize, Serialize};

/// A single exchange: what the agent said and what the user answered.
///
/// When `user_asked` is set the order is reversed: the user asked
/// `user_utterance` and the agent answered with `ai_utterance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub ai_utterance: String,
    pub user_utterance: Option<String>,
    #[serde(default)]
    pub user_asked: bool,
}

impl ConversationTurn {
    /// Creates a turn that is still waiting for the user's reply.
    pub fn new(ai_utterance: String) -> Self {
        Self {
            ai_utterance,
            user_utterance: None,
            user_asked: false,
        }
    }
}

/// Ordered turn-pairs for the topic currently being discussed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationLedger {
    turns: Vec<ConversationTurn>,
}

impl ConversationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an agent utterance that opens a new turn-pair.
    pub fn push_ai(&mut self, text: impl Into<String>) {
        self.turns.push(ConversationTurn::new(text.into()));
    }

    /// Appends a question the user asked together with the agent's answer.
    pub fn push_user_question(&mut self, question: impl Into<String>, answer: impl Into<String>) {
        self.turns.push(ConversationTurn {
            ai_utterance: answer.into(),
            user_utterance: Some(question.into()),
            user_asked: true,
        });
    }

    /// Fills the reply of the latest turn.
    ///
    /// Returns `false` without touching anything if there is no open turn or the
    /// latest turn was already answered; a reply is written at most once.
    pub fn record_reply(&mut self, text: impl Into<String>) -> bool {
        match self.turns.last_mut() {
            Some(turn) if turn.user_utterance.is_none() => {
                turn.user_utterance = Some(text.into());
                true
            }
            _ => false,
        }
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Empties the ledger, handing back everything that was recorded.
    pub fn drain(&mut self) -> Vec<ConversationTurn> {
        std::mem::take(&mut self.turns)
    }

    /// Discards the ledger without summarizing it.
    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

/// Append-only list of summaries for topics that concluded during this session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopicMemory {
    summaries: Vec<String>,
}

impl TopicMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, summary: impl Into<String>) {
        self.summaries.push(summary.into());
    }

    pub fn summaries(&self) -> &[String] {
        &self.summaries
    }

}

/// Builds a one-line summary locally when the gateway could not produce one.
pub fn fallback_summary(history: &[ConversationTurn]) -> String {
    match history.first() {
        Some(turn) => format!("Discussed: {}", turn.ai_utterance.trim()),
        None => "Discussed a topic from the material.".to_string(),
    }
}

//! Turn-taking core of the study buddy.
//!
//! A [`session::StudySession`] decides who speaks and when: proactive questions
//! about the study material, questions the user asks on their own, inactivity
//! nudges and pomodoro breaks all go through one turn machine. Model calls sit
//! behind [`gateway::AiGateway`] and audio behind [`speech::SpeechPipeline`].

pub mod config;
pub mod events;
pub mod gateway;
pub mod memory;
pub mod pomodoro;
pub mod scheduler;
pub mod session;
pub mod speech;
pub mod turn;
pub mod watchdog;

pub use config::SessionConfig;
pub use events::{SessionEvent, Speaker};
pub use gateway::{AiGateway, LLMGateway, Question, QuestionSet};
pub use session::{SessionError, SessionHandle, SessionSnapshot, StudySession};
pub use speech::{AudioBlob, CaptureControl, SpeechError, SpeechPipeline};
pub use turn::{TurnKind, TurnRejection, TurnState};

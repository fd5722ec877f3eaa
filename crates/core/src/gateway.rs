//! AI Gateway
//!
//! Every call the study buddy makes to a language model goes through the
//! [`AiGateway`] trait: turning a page of material into questions, choosing the
//! next proactive question, continuing a conversation, answering a user question
//! and summarizing a finished topic.

use crate::memory::ConversationTurn;
use crate::scheduler::SchedulerDecision;
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequestArgs, ImageUrlArgs, ResponseFormat,
    },
};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use tracing::debug;

/// One question printed in the study material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// The label printed next to the question ("4", "2b", ...).
    #[serde(deserialize_with = "string_or_number")]
    pub number: String,
    pub text: String,
}

impl Question {
    pub fn new(number: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            text: text.into(),
        }
    }
}

/// The questions extracted from the material of a study session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionSet {
    pub questions: Vec<Question>,
}

impl QuestionSet {
    pub fn new(questions: Vec<Question>) -> Self {
        Self { questions }
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn find(&self, number: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.number == number)
    }
}

/// The gateway's continuation of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(alias = "responseText", alias = "response")]
    pub response_text: String,
    /// `true` is the only signal that ends a topic.
    #[serde(default, alias = "topicResolved", alias = "resolved")]
    pub topic_resolved: bool,
}

/// Material context sent alongside a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationContext {
    pub questions: QuestionSet,
    pub topic_summaries: Vec<String>,
}

/// Everything needed to answer a question the user asked on their own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerContext {
    pub questions: QuestionSet,
    /// The proactive question that was on its way when the user spoke up.
    pub interrupted_question: Option<String>,
    pub history: Vec<ConversationTurn>,
    pub question: String,
}

/// Defines the contract for any model backend the study buddy talks to.
///
/// Implementations are stateless per call. Callers treat every error as "no
/// result" and never let it escape into the turn machine.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AiGateway: Send + Sync {
    /// Reads the questions printed on a page of material.
    async fn extract_questions(&self, image: &[u8], mime_type: &str) -> Result<QuestionSet>;

    /// Chooses the next proactive question, steering clear of covered topics.
    async fn propose_question(
        &self,
        questions: &QuestionSet,
        cycle: u64,
        topic_summaries: &[String],
    ) -> Result<SchedulerDecision>;

    async fn continue_conversation(
        &self,
        history: &[ConversationTurn],
        context: &ConversationContext,
    ) -> Result<Reply>;

    /// Condenses a finished topic into a single line.
    async fn summarize(&self, history: &[ConversationTurn]) -> Result<String>;

    async fn answer_question(&self, context: &AnswerContext) -> Result<String>;
}

/// An implementation of `AiGateway` backed by any OpenAI-compatible API.
///
/// Prompts are templates keyed by name; each call fills its placeholders and asks
/// for a JSON object where a structured answer is expected.
pub struct LLMGateway {
    client: Client<OpenAIConfig>,
    model: String,
    prompts: HashMap<String, String>,
}

impl LLMGateway {
    /// Creates a new gateway.
    ///
    /// # Arguments
    ///
    /// * `config` - OpenAI API configuration (API key, base URL, etc.).
    /// * `model` - Model identifier used for chat completions (e.g., "gpt-4o").
    /// * `prompts` - Templates keyed by `extract_questions`, `propose_question`,
    ///   `continue_conversation`, `summarize` and `answer_question`.
    pub fn new(config: OpenAIConfig, model: String, prompts: HashMap<String, String>) -> Self {
        Self {
            client: Client::with_config(config),
            model,
            prompts,
        }
    }

    fn template(&self, name: &str) -> Result<&str> {
        self.prompts
            .get(name)
            .map(String::as_str)
            .with_context(|| format!("Missing prompt template: '{name}'"))
    }

    async fn complete(&self, messages: Vec<ChatCompletionRequestMessage>, json: bool) -> Result<String> {
        let request = if json {
            CreateChatCompletionRequestArgs::default()
                .model(&self.model)
                .messages(messages)
                .response_format(ResponseFormat::JsonObject)
                .build()?
        } else {
            CreateChatCompletionRequestArgs::default()
                .model(&self.model)
                .messages(messages)
                .build()?
        };

        let response = self.client.chat().create(request).await?;
        let answer = response
            .choices
            .first()
            .context("No response choice from LLM")?
            .message
            .content
            .clone()
            .context("No content in LLM response")?;
        debug!(chars = answer.len(), "LLM call completed");
        Ok(answer)
    }

    async fn complete_prompt(&self, prompt: String, json: bool) -> Result<String> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content("You are a friendly study buddy helping a student learn their material.")
                .build()?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()?
                .into(),
        ];
        self.complete(messages, json).await
    }
}

#[async_trait]
impl AiGateway for LLMGateway {
    async fn extract_questions(&self, image: &[u8], mime_type: &str) -> Result<QuestionSet> {
        let prompt = self.template("extract_questions")?.to_string();
        let parts: Vec<ChatCompletionRequestUserMessageContentPart> = vec![
            ChatCompletionRequestMessageContentPartTextArgs::default()
                .text(prompt)
                .build()?
                .into(),
            ChatCompletionRequestMessageContentPartImageArgs::default()
                .image_url(
                    ImageUrlArgs::default()
                        .url(encode_data_url(image, mime_type))
                        .build()?,
                )
                .build()?
                .into(),
        ];
        let message: ChatCompletionRequestMessage = ChatCompletionRequestUserMessageArgs::default()
            .content(parts)
            .build()?
            .into();

        let raw = self.complete(vec![message], true).await?;
        let set: QuestionSet = parse_json(&raw).context("Failed to parse extracted questions")?;
        Ok(set)
    }

    async fn propose_question(
        &self,
        questions: &QuestionSet,
        cycle: u64,
        topic_summaries: &[String],
    ) -> Result<SchedulerDecision> {
        let prompt = self
            .template("propose_question")?
            .replace("{questions}", &render_questions(questions))
            .replace("{cycle}", &cycle.to_string())
            .replace("{summaries}", &render_summaries(topic_summaries));
        let raw = self.complete_prompt(prompt, true).await?;
        parse_json(&raw).context("Failed to parse proposed question")
    }

    async fn continue_conversation(
        &self,
        history: &[ConversationTurn],
        context: &ConversationContext,
    ) -> Result<Reply> {
        let prompt = self
            .template("continue_conversation")?
            .replace("{questions}", &render_questions(&context.questions))
            .replace("{summaries}", &render_summaries(&context.topic_summaries))
            .replace("{history}", &render_history(history));
        let raw = self.complete_prompt(prompt, true).await?;
        parse_json(&raw).context("Failed to parse conversation reply")
    }

    async fn summarize(&self, history: &[ConversationTurn]) -> Result<String> {
        let prompt = self
            .template("summarize")?
            .replace("{history}", &render_history(history));
        let summary = self.complete_prompt(prompt, false).await?;
        let line = summary
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .context("Empty summary from LLM")?;
        Ok(line.to_string())
    }

    async fn answer_question(&self, context: &AnswerContext) -> Result<String> {
        let interrupted = context
            .interrupted_question
            .as_deref()
            .unwrap_or("(none)");
        let prompt = self
            .template("answer_question")?
            .replace("{questions}", &render_questions(&context.questions))
            .replace("{interrupted}", interrupted)
            .replace("{history}", &render_history(&context.history))
            .replace("{question}", &context.question);
        let answer = self.complete_prompt(prompt, false).await?;
        Ok(answer.trim().to_string())
    }
}

fn encode_data_url(data: &[u8], mime_type: &str) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(data))
}

/// Parses a JSON object out of an LLM answer, tolerating Markdown code fences.
pub fn parse_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    Ok(serde_json::from_str(body)?)
}

fn render_questions(questions: &QuestionSet) -> String {
    questions
        .questions
        .iter()
        .map(|q| format!("{}. {}", q.number, q.text))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_summaries(summaries: &[String]) -> String {
    if summaries.is_empty() {
        return "(none yet)".to_string();
    }
    summaries
        .iter()
        .map(|s| format!("- {s}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_history(history: &[ConversationTurn]) -> String {
    let mut lines = Vec::with_capacity(history.len() * 2);
    for turn in history {
        match (&turn.user_utterance, turn.user_asked) {
            (Some(question), true) => {
                lines.push(format!("USER: {question}"));
                lines.push(format!("AI: {}", turn.ai_utterance));
            }
            (reply, _) => {
                lines.push(format!("AI: {}", turn.ai_utterance));
                if let Some(reply) = reply {
                    lines.push(format!("USER: {reply}"));
                }
            }
        }
    }
    lines.join("\n")
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Label {
        Text(String),
        Number(serde_json::Number),
    }
    Ok(match Label::deserialize(deserializer)? {
        Label::Text(s) => s,
        Label::Number(n) => n.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ConversationLedger;

    #[test]
    fn test_parse_json_strips_code_fences() {
        let raw = "```json\n{\"delay\": 3, \"targetId\": \"4\", \"question\": \"What is 4?\"}\n```";
        let decision: SchedulerDecision = parse_json(raw).unwrap();
        assert_eq!(decision.delay_seconds, 3);
        assert_eq!(decision.target_topic_id.as_deref(), Some("4"));
    }

    #[test]
    fn test_parse_json_rejects_prose() {
        assert!(parse_json::<Reply>("Sure! Here's my answer.").is_err());
    }

    #[test]
    fn test_reply_accepts_camel_case() {
        let reply: Reply =
            parse_json(r#"{"responseText": "Great!", "topicResolved": true}"#).unwrap();
        assert!(reply.topic_resolved);
        let reply: Reply = parse_json(r#"{"response_text": "Go on"}"#).unwrap();
        assert!(!reply.topic_resolved);
    }

    #[test]
    fn test_question_number_may_be_numeric() {
        let set: QuestionSet = parse_json(
            r#"{"questions": [{"number": 4, "text": "Define entropy."}, {"number": "5a", "text": "Why?"}]}"#,
        )
        .unwrap();
        assert_eq!(set.questions[0].number, "4");
        assert_eq!(set.find("5a").map(|q| q.text.as_str()), Some("Why?"));
    }

    #[test]
    fn test_render_history_skips_missing_replies() {
        let history = vec![
            ConversationTurn {
                ai_utterance: "What is a stack?".into(),
                user_utterance: Some("LIFO".into()),
                user_asked: false,
            },
            ConversationTurn::new("And a queue?".into()),
        ];
        assert_eq!(
            render_history(&history),
            "AI: What is a stack?\nUSER: LIFO\nAI: And a queue?"
        );
    }

    #[test]
    fn test_render_history_puts_user_questions_first() {
        let mut ledger = ConversationLedger::new();
        ledger.push_user_question("When is the exam?", "On Friday.");
        assert_eq!(
            render_history(ledger.turns()),
            "USER: When is the exam?\nAI: On Friday."
        );
    }

    #[test]
    fn test_render_summaries_placeholder_when_empty() {
        assert_eq!(render_summaries(&[]), "(none yet)");
        assert_eq!(render_summaries(&["a".to_string()]), "- a");
    }

    #[test]
    fn test_data_url_encoding() {
        assert_eq!(
            encode_data_url(b"hi", "image/png"),
            "data:image/png;base64,aGk="
        );
    }

    #[tokio::test]
    async fn test_missing_template_is_an_error() {
        let gateway = LLMGateway::new(OpenAIConfig::new(), "gpt-4o".into(), HashMap::new());
        let err = gateway.summarize(&[]).await.unwrap_err();
        assert!(err.to_string().contains("summarize"));
    }
}

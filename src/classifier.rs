//! Intent classification
//!
//! Picks which capability takes ownership of an unowned conversation. Reset
//! commands are recognised separately by [`is_reset_command`] so the router
//! can short-circuit before any classifier call.

use crate::capability::{Capability, InboundMessage};
use crate::db::{Direction, Message};
use crate::llm::{LlmError, LlmMessage, LlmRequest, LlmService};
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

/// Literal commands that clear the session lock
const RESET_KEYWORDS: &[&str] = &[
    "cancel",
    "reset",
    "menu",
    "main menu",
    "start over",
    "stop",
    "quit",
    "exit",
];

static SCHEDULING_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(schedul\w*|book(ing)?|appointments?|consultations?|availab\w*|slots?|reschedul\w*|calendar)\b",
    )
    .expect("scheduling pattern is valid")
});

static IMAGE_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(photos?|images?|pictures?|pics?|selfies?)\b")
        .expect("image pattern is valid")
});

/// Prior messages shown to the completion-backed stage
const CLASSIFIER_HISTORY: usize = 4;

const CLASSIFIER_PROMPT: &str = "You route messages for a clinic's patient desk. \
Reply with exactly one word, the name of the team that should answer the latest message:\n\
scheduling - booking, moving or cancelling consultations and appointments\n\
knowledge - questions about treatments, prices, procedures or recovery\n\
image - anything about photos the patient sent or wants to send\n\
general - greetings and everything else";

/// True when the whole message is one of the literal reset commands.
/// Trailing punctuation and surrounding whitespace are ignored.
pub fn is_reset_command(text: &str) -> bool {
    let normalized = text
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .trim()
        .to_lowercase();
    RESET_KEYWORDS.contains(&normalized.as_str())
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classifier call failed: {0}")]
    Llm(#[from] LlmError),
    #[error("ambiguous classifier answer: {0:?}")]
    Ambiguous(String),
}

/// Chooses a capability for a conversation with no active owner.
/// Has no side effects on shared state.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        message: &InboundMessage,
        history: &[Message],
    ) -> Result<Capability, ClassifyError>;
}

#[async_trait]
impl<T: Classifier + ?Sized> Classifier for Arc<T> {
    async fn classify(
        &self,
        message: &InboundMessage,
        history: &[Message],
    ) -> Result<Capability, ClassifyError> {
        (**self).classify(message, history).await
    }
}

/// Keyword rules first, then the completion service when one is configured
pub struct IntentClassifier {
    llm: Option<Arc<dyn LlmService>>,
}

impl IntentClassifier {
    pub fn new(llm: Option<Arc<dyn LlmService>>) -> Self {
        Self { llm }
    }

    fn match_keywords(message: &InboundMessage) -> Option<Capability> {
        if SCHEDULING_INTENT.is_match(&message.text) {
            return Some(Capability::Scheduling);
        }
        if !message.media_refs.is_empty() || IMAGE_INTENT.is_match(&message.text) {
            return Some(Capability::Image);
        }
        None
    }
}

#[async_trait]
impl Classifier for IntentClassifier {
    async fn classify(
        &self,
        message: &InboundMessage,
        history: &[Message],
    ) -> Result<Capability, ClassifyError> {
        if let Some(capability) = Self::match_keywords(message) {
            tracing::debug!(%capability, stage = "keyword", "Classified message");
            return Ok(capability);
        }

        let Some(llm) = &self.llm else {
            return Ok(Capability::General);
        };

        let request = LlmRequest {
            system: CLASSIFIER_PROMPT.to_string(),
            messages: vec![LlmMessage::user_text(render_transcript(history, message))],
            max_tokens: Some(10),
        };
        // The router's classifier timeout bounds both attempts
        let response = match llm.complete(&request).await {
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    kind = %e.kind,
                    error = %e.message,
                    "Classifier call failed, retrying once"
                );
                llm.complete(&request).await?
            }
            result => result?,
        };
        let answer = response.text();
        let capability = parse_answer(&answer).ok_or(ClassifyError::Ambiguous(answer))?;
        tracing::debug!(%capability, stage = "completion", "Classified message");
        Ok(capability)
    }
}

fn render_transcript(history: &[Message], message: &InboundMessage) -> String {
    let start = history.len().saturating_sub(CLASSIFIER_HISTORY);
    let mut transcript = String::new();
    for msg in &history[start..] {
        let speaker = match msg.direction {
            Direction::Inbound => "Patient",
            Direction::Outbound => "Desk",
        };
        transcript.push_str(&format!("{speaker}: {}\n", msg.content));
    }
    transcript.push_str(&format!("Latest message: {}", message.text));
    transcript
}

/// Accepts exactly one capability name, ignoring case and surrounding
/// punctuation; anything else is ambiguous.
fn parse_answer(answer: &str) -> Option<Capability> {
    answer
        .trim()
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_lowercase()
        .parse()
        .ok()
}

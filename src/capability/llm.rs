//! Completion-backed capability

use super::{
    Capability, CapabilityError, CapabilityHandler, ChunkStream, InboundMessage, StreamChunk,
};
use crate::db::{Direction, Message};
use crate::llm::{ContentBlock, LlmMessage, LlmRequest, LlmService, MessageRole};
use futures::stream::{self, StreamExt};
use std::sync::Arc;

const MAX_REPLY_TOKENS: u32 = 1024;

/// Marker a scheduling reply uses once the booking is done
const BOOKING_CONFIRMED: &str = "booking confirmed";

/// A capability answered by one completion call with a persona prompt
pub struct LlmCapability {
    capability: Capability,
    llm: Option<Arc<dyn LlmService>>,
}

impl LlmCapability {
    pub fn new(capability: Capability, llm: Option<Arc<dyn LlmService>>) -> Self {
        Self { capability, llm }
    }
}

impl CapabilityHandler for LlmCapability {
    fn run(&self, history: &[Message], message: &InboundMessage) -> ChunkStream {
        let Some(llm) = self.llm.clone() else {
            return stream::once(async {
                Err(CapabilityError::Failed(
                    "no completion service configured".to_string(),
                ))
            })
            .boxed();
        };

        let capability = self.capability;
        let request = build_request(capability, history, message);

        stream::once(async move {
            let response = llm.complete(&request).await?;
            let text = response.text();
            let done = capability == Capability::Scheduling
                && text.to_lowercase().contains(BOOKING_CONFIRMED);
            let chunk = StreamChunk::last(text);
            Ok::<_, CapabilityError>(if done { chunk.completing_flow() } else { chunk })
        })
        .boxed()
    }
}

fn system_prompt(capability: Capability) -> &'static str {
    match capability {
        Capability::Scheduling => {
            "You are the clinic's scheduling assistant. Help the patient pick a consultation \
             slot, collect the details needed to book it, and keep replies short. When the \
             booking is complete, say \"Booking confirmed\" followed by the appointment summary."
        }
        Capability::Knowledge => {
            "You answer questions about the clinic's treatments, packages and procedures. \
             Be accurate and concise; if you do not know, offer to connect the patient to a \
             coordinator."
        }
        Capability::Image => {
            "You triage photos patients send in. Describe what is visible in neutral terms, \
             ask for a clearer or additional photo when needed, and never give a diagnosis."
        }
        Capability::General => {
            "You are the clinic's front-desk assistant. Greet the patient, answer briefly, and \
             point them to scheduling, treatment information or photo review as appropriate."
        }
    }
}

/// Role-tagged history plus the new message, shaped for the completion API
fn build_request(
    capability: Capability,
    history: &[Message],
    message: &InboundMessage,
) -> LlmRequest {
    let mut messages: Vec<LlmMessage> = Vec::new();

    for msg in history {
        let role = match msg.direction {
            Direction::Inbound => MessageRole::User,
            Direction::Outbound => MessageRole::Assistant,
        };
        // Conversations handed to the model start with the patient
        if messages.is_empty() && role == MessageRole::Assistant {
            continue;
        }
        let text = with_media_notes(&msg.content, &msg.media_refs);
        push_merged(&mut messages, role, vec![ContentBlock::text(text)]);
    }

    let content = if capability == Capability::Image {
        let mut blocks = vec![ContentBlock::text(message.text.clone())];
        blocks.extend(message.media_refs.iter().map(ContentBlock::image_url));
        blocks
    } else {
        vec![ContentBlock::text(with_media_notes(
            &message.text,
            &message.media_refs,
        ))]
    };
    push_merged(&mut messages, MessageRole::User, content);

    LlmRequest {
        system: system_prompt(capability).to_string(),
        messages,
        max_tokens: Some(MAX_REPLY_TOKENS),
    }
}

fn push_merged(messages: &mut Vec<LlmMessage>, role: MessageRole, content: Vec<ContentBlock>) {
    match messages.last_mut() {
        Some(last) if last.role == role => last.content.extend(content),
        _ => messages.push(LlmMessage { role, content }),
    }
}

fn with_media_notes(text: &str, media_refs: &[String]) -> String {
    media_refs.iter().fold(text.to_string(), |acc, url| {
        if acc.is_empty() {
            format!("[Media: {url}]")
        } else {
            format!("{acc} [Media: {url}]")
        }
    })
}

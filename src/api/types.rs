//! API request and response types

use crate::db::{Conversation, Message, SessionLock};
use serde::{Deserialize, Serialize};

/// Web chat message
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
}

/// Buffered web chat reply
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub content: String,
}

/// Operator view of one conversation
#[derive(Debug, Serialize)]
pub struct ConversationDetailResponse {
    pub conversation: Conversation,
    pub session_lock: SessionLock,
    pub messages: Vec<Message>,
}

/// Response for lifecycle actions
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

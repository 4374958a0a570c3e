//! Completion service errors

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
}

/// What went wrong, coarse enough to decide whether to try again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Never got a complete HTTP exchange
    Transport,
    /// 429
    RateLimited,
    /// 5xx
    Unavailable,
    /// Any other non-success status: bad key, bad request
    Rejected,
    /// Success status but a body we could not read
    Malformed,
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transport => "transport",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Rejected => "rejected",
            Self::Malformed => "malformed",
        })
    }
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Transport, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Malformed, message)
    }

    /// Map a non-success provider status
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            429 => LlmErrorKind::RateLimited,
            500..=599 => LlmErrorKind::Unavailable,
            _ => LlmErrorKind::Rejected,
        };
        Self::new(kind, format!("HTTP {status}: {body}"))
    }

    /// The same request may succeed if sent again
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            LlmErrorKind::Transport | LlmErrorKind::RateLimited | LlmErrorKind::Unavailable
        )
    }
}

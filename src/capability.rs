//! Response-generating capabilities
//!
//! A capability turns conversation history plus one new message into a lazy,
//! finite, single-pass stream of text chunks. Capabilities never persist
//! anything and never touch session locks; the router owns both.

mod llm;

pub use llm::LlmCapability;

use crate::db::Message;
use crate::llm::{LlmError, LlmService};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// The closed set of capabilities a conversation can be routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Scheduling,
    Knowledge,
    Image,
    General,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Scheduling,
        Capability::Knowledge,
        Capability::Image,
        Capability::General,
    ];

    /// Stable name stored in the session lock
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Scheduling => "scheduling",
            Capability::Knowledge => "knowledge",
            Capability::Image => "image",
            Capability::General => "general",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown capability: {s}"))
    }
}

/// The new message a capability is asked to answer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub text: String,
    pub media_refs: Vec<String>,
}

/// One increment of a streamed reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub content: String,
    pub is_final: bool,
    /// Set on a terminal chunk when the capability's multi-turn flow is
    /// finished and the conversation should be routed afresh next time.
    pub flow_complete: bool,
}

impl StreamChunk {
    #[allow(dead_code)] // Used by multi-chunk capabilities in tests
    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_final: false,
            flow_complete: false,
        }
    }

    /// Terminal chunk, possibly carrying the last piece of text
    pub fn last(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_final: true,
            flow_complete: false,
        }
    }

    #[must_use]
    pub fn completing_flow(mut self) -> Self {
        self.flow_complete = true;
        self
    }
}

/// Errors a capability can raise mid-stream
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("completion failed: {0}")]
    Llm(#[from] LlmError),
    #[error("{0}")]
    Failed(String),
}

pub type ChunkStream = BoxStream<'static, Result<StreamChunk, CapabilityError>>;

/// Uniform streaming contract every capability implements
pub trait CapabilityHandler: Send + Sync {
    /// Start generating a reply. Each call starts from scratch; the
    /// returned stream cannot be restarted.
    fn run(&self, history: &[Message], message: &InboundMessage) -> ChunkStream;
}

/// One handler per capability, resolved through a single exhaustive match
pub struct CapabilityRegistry {
    scheduling: Arc<dyn CapabilityHandler>,
    knowledge: Arc<dyn CapabilityHandler>,
    image: Arc<dyn CapabilityHandler>,
    general: Arc<dyn CapabilityHandler>,
}

impl CapabilityRegistry {
    pub fn new(
        scheduling: Arc<dyn CapabilityHandler>,
        knowledge: Arc<dyn CapabilityHandler>,
        image: Arc<dyn CapabilityHandler>,
        general: Arc<dyn CapabilityHandler>,
    ) -> Self {
        Self {
            scheduling,
            knowledge,
            image,
            general,
        }
    }

    /// Production registry: every capability backed by the completion service
    pub fn from_llm(llm: Option<Arc<dyn LlmService>>) -> Self {
        let make = |capability| -> Arc<dyn CapabilityHandler> {
            Arc::new(LlmCapability::new(capability, llm.clone()))
        };
        Self::new(
            make(Capability::Scheduling),
            make(Capability::Knowledge),
            make(Capability::Image),
            make(Capability::General),
        )
    }

    pub fn handler(&self, capability: Capability) -> &Arc<dyn CapabilityHandler> {
        match capability {
            Capability::Scheduling => &self.scheduling,
            Capability::Knowledge => &self.knowledge,
            Capability::Image => &self.image,
            Capability::General => &self.general,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_names_round_trip() {
        for capability in Capability::ALL {
            assert_eq!(capability.as_str().parse::<Capability>().unwrap(), capability);
        }
        assert!("billing".parse::<Capability>().is_err());
        assert!("Scheduling".parse::<Capability>().is_err());
    }

    #[test]
    fn test_chunk_constructors() {
        assert!(!StreamChunk::delta("a").is_final);
        let last = StreamChunk::last("b");
        assert!(last.is_final && !last.flow_complete);
        assert!(StreamChunk::last("").completing_flow().flow_complete);
    }
}

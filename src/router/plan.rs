//! Pure routing decisions
//!
//! Everything the turn executor decides without I/O lives here so the
//! invariants can be checked exhaustively.

use crate::capability::{Capability, StreamChunk};
use crate::classifier::is_reset_command;
use std::fmt;

/// Phases of one turn, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Resolving,
    LockCheck,
    Classifying,
    Dispatched,
    Streaming,
    Persisting,
    LockUpdate,
    Done,
    Error,
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnPhase::Resolving => "resolving",
            TurnPhase::LockCheck => "lock_check",
            TurnPhase::Classifying => "classifying",
            TurnPhase::Dispatched => "dispatched",
            TurnPhase::Streaming => "streaming",
            TurnPhase::Persisting => "persisting",
            TurnPhase::LockUpdate => "lock_update",
            TurnPhase::Done => "done",
            TurnPhase::Error => "error",
        };
        f.write_str(name)
    }
}

/// Where a turn goes after the lock check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Release the lock and acknowledge; no capability runs
    Reset,
    /// An active owner takes the turn without reclassification
    Sticky(Capability),
    /// No active owner; classify and try to acquire
    Classify,
}

pub fn route(text: &str, owner: Option<Capability>) -> Route {
    if is_reset_command(text) {
        return Route::Reset;
    }
    match owner {
        Some(capability) => Route::Sticky(capability),
        None => Route::Classify,
    }
}

/// How a capability's chunk stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed { text: String, flow_complete: bool },
    Failed { reason: String },
}

/// What LOCK_UPDATE does for a given stream outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockUpdate {
    Refresh,
    Release,
    /// Failed turns leave the lock alone so the same capability is retried
    Untouched,
}

impl StreamOutcome {
    pub fn lock_update(&self) -> LockUpdate {
        match self {
            StreamOutcome::Completed {
                flow_complete: true,
                ..
            } => LockUpdate::Release,
            StreamOutcome::Completed { .. } => LockUpdate::Refresh,
            StreamOutcome::Failed { .. } => LockUpdate::Untouched,
        }
    }
}

/// Collects chunk text until the terminal chunk arrives
#[derive(Debug, Default)]
pub struct ReplyAccumulator {
    text: String,
    chunks: usize,
}

impl ReplyAccumulator {
    /// Add one chunk. Returns the finished outcome on the terminal chunk;
    /// the caller stops pulling at that point.
    pub fn push(&mut self, chunk: &StreamChunk) -> Option<StreamOutcome> {
        self.text.push_str(&chunk.content);
        self.chunks += 1;
        chunk.is_final.then(|| StreamOutcome::Completed {
            text: std::mem::take(&mut self.text),
            flow_complete: chunk.flow_complete,
        })
    }

    /// The stream ended without a terminal chunk
    pub fn truncated(self) -> StreamOutcome {
        StreamOutcome::Failed {
            reason: format!("stream ended after {} chunks without a final chunk", self.chunks),
        }
    }
}

//! Turn routing
//!
//! Resolve identity, check the session lock, classify when unowned,
//! dispatch to one capability, stream and persist the reply, then refresh
//! or release the lock. Every turn ends in a reply or the fallback message.

mod executor;
mod plan;
pub mod traits;

#[cfg(test)]
pub mod testing;

#[allow(unused_imports)] // Public API re-exports
pub use executor::{
    InboundTurn, TurnEvent, TurnKind, TurnOutcome, TurnReply, TurnRouter, FALLBACK_REPLY,
    RESET_REPLY,
};
pub use traits::*;

use crate::classifier::IntentClassifier;

/// Router with the production storage and classifier
pub type ProductionRouter = TurnRouter<DatabaseStorage, IntentClassifier>;

//! Turn executor

use super::plan::{route, LockUpdate, ReplyAccumulator, Route, StreamOutcome, TurnPhase};
use super::traits::{Clock, Storage};
use crate::capability::{Capability, CapabilityRegistry, InboundMessage};
use crate::classifier::Classifier;
use crate::config::RoutingConfig;
use crate::db::{Channel, Direction, Message};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Canned reply for a literal reset command
pub const RESET_REPLY: &str =
    "I've reset our conversation. How can I help you today? You can ask about booking a \
     consultation, our treatments, or send us a photo for review.";

/// The one user-visible failure message
pub const FALLBACK_REPLY: &str =
    "I'm sorry, I'm having some technical difficulties right now. I'm connecting you with a \
     member of our team, who will follow up shortly.";

/// Bounded so a fast capability cannot run arbitrarily far ahead of a slow client
const EVENT_BUFFER: usize = 32;

/// Attempts at acquiring an unowned lock before giving up on the turn
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// One inbound message from a transport
#[derive(Debug, Clone)]
pub struct InboundTurn {
    pub channel: Channel,
    pub external_handle: String,
    pub message: InboundMessage,
}

/// Delivery events for the caller's transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// Next increment of the reply
    Delta(String),
    /// The turn failed; show this instead of anything delivered so far
    Fallback {
        text: String,
        replaces_previous: bool,
    },
    /// Always the last event of a turn
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    Replied,
    Reset,
    Fallback,
}

/// Final result of a turn, available even if the caller went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub kind: TurnKind,
    pub reply: String,
    pub conversation_id: Option<String>,
    pub capability: Option<Capability>,
}

pub struct TurnReply {
    pub events: mpsc::Receiver<TurnEvent>,
    pub outcome: JoinHandle<TurnOutcome>,
}

/// Routes inbound turns to capabilities. Stateless between turns: all
/// coordination goes through the storage's session locks.
pub struct TurnRouter<S, K>
where
    S: Storage + Clone + 'static,
    K: Classifier + 'static,
{
    storage: S,
    classifier: Arc<K>,
    capabilities: Arc<CapabilityRegistry>,
    clock: Arc<dyn Clock>,
    config: RoutingConfig,
}

impl<S, K> Clone for TurnRouter<S, K>
where
    S: Storage + Clone + 'static,
    K: Classifier + 'static,
{
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            classifier: Arc::clone(&self.classifier),
            capabilities: Arc::clone(&self.capabilities),
            clock: Arc::clone(&self.clock),
            config: self.config,
        }
    }
}

/// Forwards events to the caller until it disconnects, then drops them
struct EventSink {
    tx: mpsc::Sender<TurnEvent>,
    connected: bool,
    delivered: bool,
}

impl EventSink {
    async fn send(&mut self, event: TurnEvent) {
        if !self.connected {
            return;
        }
        if matches!(event, TurnEvent::Delta(_)) {
            self.delivered = true;
        }
        if self.tx.send(event).await.is_err() {
            tracing::debug!("Caller disconnected, draining turn without delivery");
            self.connected = false;
        }
    }
}

impl<S, K> TurnRouter<S, K>
where
    S: Storage + Clone + 'static,
    K: Classifier + 'static,
{
    pub fn new(
        storage: S,
        classifier: K,
        capabilities: CapabilityRegistry,
        clock: Arc<dyn Clock>,
        config: RoutingConfig,
    ) -> Self {
        Self {
            storage,
            classifier: Arc::new(classifier),
            capabilities: Arc::new(capabilities),
            clock,
            config,
        }
    }

    /// Start a turn. It runs to completion in its own task whether or not
    /// the caller keeps reading `events`.
    pub fn handle_turn(&self, turn: InboundTurn) -> TurnReply {
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let span = tracing::info_span!(
            "turn",
            channel = %turn.channel,
            conv_id = tracing::field::Empty
        );
        let router = self.clone();
        let outcome = tokio::spawn(
            async move {
                let mut sink = EventSink {
                    tx,
                    connected: true,
                    delivered: false,
                };
                let outcome = router.execute(turn, &mut sink).await;
                sink.send(TurnEvent::Finished).await;
                tracing::debug!(phase = %TurnPhase::Done, kind = ?outcome.kind, "Turn finished");
                outcome
            }
            .instrument(span),
        );
        TurnReply { events, outcome }
    }

    /// Buffered delivery: wait for the whole reply
    pub async fn reply(&self, turn: InboundTurn) -> String {
        let TurnReply { events, outcome } = self.handle_turn(turn);
        drop(events);
        match outcome.await {
            Ok(outcome) => outcome.reply,
            Err(e) => {
                tracing::error!(error = %e, "Turn task failed");
                FALLBACK_REPLY.to_string()
            }
        }
    }

    async fn execute(&self, turn: InboundTurn, sink: &mut EventSink) -> TurnOutcome {
        let InboundTurn {
            channel,
            external_handle,
            message,
        } = turn;

        tracing::debug!(phase = %TurnPhase::Resolving, "Resolving identity");
        let conversation = match self
            .storage
            .resolve(channel, &external_handle, self.clock.now())
            .await
        {
            Ok(conversation) => conversation,
            Err(e) => {
                tracing::error!(phase = %TurnPhase::Error, error = %e, "Identity resolution failed");
                return fallback(sink, None, None).await;
            }
        };
        let conv_id = conversation.id;
        tracing::Span::current().record("conv_id", conv_id.as_str());

        let history = match self.storage.recent(&conv_id, self.config.history_limit).await {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load history, continuing without it");
                Vec::new()
            }
        };

        if let Err(e) = self
            .storage
            .append(
                &conv_id,
                Direction::Inbound,
                &message.text,
                &message.media_refs,
                self.clock.now(),
            )
            .await
        {
            tracing::error!(error = %e, "Failed to log inbound message");
        }

        tracing::debug!(phase = %TurnPhase::LockCheck, "Checking session lock");
        let owner = match self.current_owner(&conv_id).await {
            Ok(owner) => owner,
            Err(e) => {
                tracing::error!(phase = %TurnPhase::Error, error = %e, "Failed to read session lock");
                return fallback(sink, Some(conv_id), None).await;
            }
        };

        let capability = match route(&message.text, owner) {
            Route::Reset => return self.reset(sink, conv_id).await,
            Route::Sticky(capability) => {
                tracing::debug!(%capability, "Sticky routing to lock owner");
                capability
            }
            Route::Classify => match self.classify_and_acquire(&conv_id, &message, &history).await {
                Some(capability) => capability,
                None => return fallback(sink, Some(conv_id), None).await,
            },
        };

        tracing::debug!(phase = %TurnPhase::Dispatched, %capability, "Dispatching turn");
        let outcome = self.stream(capability, &history, &message, sink).await;

        let text = match &outcome {
            StreamOutcome::Completed { text, .. } => text.clone(),
            StreamOutcome::Failed { reason } => {
                tracing::warn!(
                    phase = %TurnPhase::Error,
                    %capability,
                    reason = %reason,
                    "Capability failed, sending fallback"
                );
                return fallback(sink, Some(conv_id), Some(capability)).await;
            }
        };

        tracing::debug!(phase = %TurnPhase::Persisting, "Persisting reply");
        if let Err(e) = self
            .storage
            .append(&conv_id, Direction::Outbound, &text, &[], self.clock.now())
            .await
        {
            tracing::error!(critical = true, error = %e, "Failed to persist outbound message");
        }

        self.update_lock(&conv_id, capability, outcome.lock_update())
            .await;

        TurnOutcome {
            kind: TurnKind::Replied,
            reply: text,
            conversation_id: Some(conv_id),
            capability: Some(capability),
        }
    }

    /// Owner as a known capability. A name outside the closed set is evicted
    /// so the conversation can be reclassified.
    async fn current_owner(&self, conv_id: &str) -> Result<Option<Capability>, String> {
        let Some(name) = self.storage.get_owner(conv_id, self.clock.now()).await? else {
            return Ok(None);
        };
        match name.parse::<Capability>() {
            Ok(capability) => Ok(Some(capability)),
            Err(e) => {
                let evicted = self.storage.release_held_by(conv_id, &name).await?;
                tracing::warn!(owner = %name, error = %e, evicted, "Evicting unknown lock owner");
                Ok(None)
            }
        }
    }

    async fn classify(&self, message: &InboundMessage, history: &[Message]) -> Capability {
        tracing::debug!(phase = %TurnPhase::Classifying, "Classifying message");
        let result = tokio::time::timeout(
            self.config.classifier_timeout,
            self.classifier.classify(message, history),
        )
        .await;
        match result {
            Ok(Ok(capability)) => capability,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Classifier failed, using general");
                Capability::General
            }
            Err(_) => {
                tracing::warn!(
                    timeout = ?self.config.classifier_timeout,
                    "Classifier timed out, using general"
                );
                Capability::General
            }
        }
    }

    /// Classify, then take the lock. A lost race dispatches to whichever
    /// capability won instead.
    async fn classify_and_acquire(
        &self,
        conv_id: &str,
        message: &InboundMessage,
        history: &[Message],
    ) -> Option<Capability> {
        let chosen = self.classify(message, history).await;

        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            let acquired = self
                .storage
                .try_acquire(
                    conv_id,
                    chosen.as_str(),
                    self.config.lock_ttl_secs,
                    self.clock.now(),
                )
                .await;
            match acquired {
                Ok(true) => {
                    tracing::info!(capability = %chosen, "Acquired session lock");
                    return Some(chosen);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Failed to acquire session lock");
                    return None;
                }
            }

            match self.current_owner(conv_id).await {
                Ok(Some(winner)) => {
                    tracing::warn!(
                        wanted = %chosen,
                        %winner,
                        "Lost lock race, dispatching to winner"
                    );
                    return Some(winner);
                }
                // Winner released or expired in between; try again
                Ok(None) => tracing::warn!(attempt, "Lock contended but unowned, retrying"),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to re-read session lock");
                    return None;
                }
            }
        }

        tracing::error!(attempts = MAX_ACQUIRE_ATTEMPTS, "Gave up acquiring session lock");
        None
    }

    /// Pull the capability's chunks to completion, forwarding each one.
    /// The whole reply shares one deadline. Delivery stops when the caller
    /// disconnects; pulling does not.
    async fn stream(
        &self,
        capability: Capability,
        history: &[Message],
        message: &InboundMessage,
        sink: &mut EventSink,
    ) -> StreamOutcome {
        tracing::debug!(phase = %TurnPhase::Streaming, %capability, "Running capability");
        let mut chunks = self.capabilities.handler(capability).run(history, message);
        let mut acc = ReplyAccumulator::default();
        let deadline = tokio::time::Instant::now() + self.config.capability_timeout;

        loop {
            let next = tokio::time::timeout_at(deadline, chunks.next()).await;
            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => {
                    return StreamOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
                Ok(None) => return acc.truncated(),
                Err(_) => {
                    return StreamOutcome::Failed {
                        reason: format!(
                            "reply not finished within {}ms",
                            self.config.capability_timeout.as_millis()
                        ),
                    }
                }
            };

            if !chunk.content.is_empty() {
                sink.send(TurnEvent::Delta(chunk.content.clone())).await;
            }
            if let Some(outcome) = acc.push(&chunk) {
                return outcome;
            }
        }
    }

    async fn update_lock(&self, conv_id: &str, capability: Capability, update: LockUpdate) {
        tracing::debug!(phase = %TurnPhase::LockUpdate, ?update, "Updating session lock");
        match update {
            LockUpdate::Refresh => {
                let refreshed = self
                    .storage
                    .refresh(
                        conv_id,
                        capability.as_str(),
                        self.config.lock_ttl_secs,
                        self.clock.now(),
                    )
                    .await;
                match refreshed {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(
                        %capability,
                        "Lost lock ownership mid-turn; reply delivered anyway"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Failed to refresh session lock"),
                }
            }
            LockUpdate::Release => {
                tracing::info!(%capability, "Flow complete, releasing session lock");
                if let Err(e) = self.storage.release(conv_id).await {
                    tracing::warn!(error = %e, "Failed to release session lock");
                }
            }
            LockUpdate::Untouched => {}
        }
    }

    async fn reset(&self, sink: &mut EventSink, conv_id: String) -> TurnOutcome {
        tracing::debug!(phase = %TurnPhase::LockUpdate, "Reset command, releasing session lock");
        if let Err(e) = self.storage.release(&conv_id).await {
            tracing::error!(error = %e, "Failed to release session lock on reset");
            return fallback(sink, Some(conv_id), None).await;
        }
        tracing::info!("Conversation reset");

        if let Err(e) = self
            .storage
            .append(&conv_id, Direction::Outbound, RESET_REPLY, &[], self.clock.now())
            .await
        {
            tracing::error!(critical = true, error = %e, "Failed to persist outbound message");
        }
        sink.send(TurnEvent::Delta(RESET_REPLY.to_string())).await;

        TurnOutcome {
            kind: TurnKind::Reset,
            reply: RESET_REPLY.to_string(),
            conversation_id: Some(conv_id),
            capability: None,
        }
    }
}

async fn fallback(
    sink: &mut EventSink,
    conversation_id: Option<String>,
    capability: Option<Capability>,
) -> TurnOutcome {
    let replaces_previous = sink.delivered;
    sink.send(TurnEvent::Fallback {
        text: FALLBACK_REPLY.to_string(),
        replaces_previous,
    })
    .await;
    TurnOutcome {
        kind: TurnKind::Fallback,
        reply: FALLBACK_REPLY.to_string(),
        conversation_id,
        capability,
    }
}

//! Mock implementations for testing
//!
//! These mocks let the turn executor run without SQLite or a completion
//! service.

use super::traits::{Clock, ConversationLog, IdentityStore, SessionLockStore};
use crate::capability::{
    Capability, CapabilityError, CapabilityHandler, ChunkStream, InboundMessage, StreamChunk,
};
use crate::classifier::{Classifier, ClassifyError};
use crate::db::{Channel, Conversation, Direction, Message, Party};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// In-memory storage
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRow {
    pub owner: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub ttl_seconds: i64,
}

impl LockRow {
    fn active_owner(&self, now: DateTime<Utc>) -> Option<&str> {
        let acquired_at = self.acquired_at?;
        if now > acquired_at + chrono::Duration::seconds(self.ttl_seconds) {
            return None;
        }
        self.owner.as_deref()
    }
}

#[derive(Default)]
struct State {
    parties: HashMap<(Channel, String), Party>,
    conversations: HashMap<String, Conversation>,
    locks: HashMap<String, LockRow>,
    messages: Vec<Message>,
    next_message_id: i64,
}

/// Storage whose every operation is atomic under one mutex, mirroring the
/// single-statement guarantees of the SQLite store
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<State>>,
    successful_acquires: Arc<AtomicUsize>,
    fail_resolve: Arc<AtomicBool>,
    fail_outbound: Arc<AtomicBool>,
    fail_next_refresh: Arc<AtomicBool>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_resolves(&self) {
        self.fail_resolve.store(true, Ordering::SeqCst);
    }

    pub fn fail_outbound_appends(&self) {
        self.fail_outbound.store(true, Ordering::SeqCst);
    }

    /// Make the next refresh report lost ownership
    pub fn fail_next_refresh(&self) {
        self.fail_next_refresh.store(true, Ordering::SeqCst);
    }

    pub fn conversation_for(&self, channel: Channel, handle: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        let party = state.parties.get(&(channel, handle.to_string()))?;
        state
            .conversations
            .values()
            .find(|c| c.party_id == party.id)
            .map(|c| c.id.clone())
    }

    pub fn party_count(&self) -> usize {
        self.state.lock().unwrap().parties.len()
    }

    pub fn successful_acquires(&self) -> usize {
        self.successful_acquires.load(Ordering::SeqCst)
    }

    pub fn lock(&self, conversation_id: &str) -> Option<LockRow> {
        self.state.lock().unwrap().locks.get(conversation_id).cloned()
    }

    pub fn owner_now(&self, conversation_id: &str, now: DateTime<Utc>) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .locks
            .get(conversation_id)
            .and_then(|row| row.active_owner(now))
            .map(String::from)
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.state
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl IdentityStore for InMemoryStorage {
    async fn resolve(
        &self,
        channel: Channel,
        external_handle: &str,
        now: DateTime<Utc>,
    ) -> Result<Conversation, String> {
        if self.fail_resolve.load(Ordering::SeqCst) {
            return Err("storage unavailable".to_string());
        }
        let mut state = self.state.lock().unwrap();
        let party_id = state
            .parties
            .entry((channel, external_handle.to_string()))
            .or_insert_with(|| Party {
                id: uuid::Uuid::new_v4().to_string(),
                channel,
                external_handle: external_handle.to_string(),
                created_at: now,
            })
            .id
            .clone();

        if let Some(existing) = state
            .conversations
            .values()
            .find(|c| c.party_id == party_id)
        {
            return Ok(existing.clone());
        }

        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            party_id,
            created_at: now,
            last_activity_at: now,
        };
        state
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        state.locks.insert(
            conversation.id.clone(),
            LockRow {
                owner: None,
                acquired_at: None,
                ttl_seconds: crate::db::DEFAULT_LOCK_TTL_SECS,
            },
        );
        Ok(conversation)
    }
}

#[async_trait]
impl SessionLockStore for InMemoryStorage {
    async fn get_owner(
        &self,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, String> {
        Ok(self.owner_now(conversation_id, now))
    }

    async fn try_acquire(
        &self,
        conversation_id: &str,
        capability: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, String> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .locks
            .entry(conversation_id.to_string())
            .or_insert(LockRow {
                owner: None,
                acquired_at: None,
                ttl_seconds,
            });
        if row.active_owner(now).is_some() {
            return Ok(false);
        }
        *row = LockRow {
            owner: Some(capability.to_string()),
            acquired_at: Some(now),
            ttl_seconds,
        };
        self.successful_acquires.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn refresh(
        &self,
        conversation_id: &str,
        capability: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, String> {
        if self.fail_next_refresh.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let mut state = self.state.lock().unwrap();
        let Some(row) = state.locks.get_mut(conversation_id) else {
            return Ok(false);
        };
        if row.active_owner(now) != Some(capability) {
            return Ok(false);
        }
        row.acquired_at = Some(now);
        row.ttl_seconds = ttl_seconds;
        Ok(true)
    }

    async fn release(&self, conversation_id: &str) -> Result<(), String> {
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state.locks.get_mut(conversation_id) {
            row.owner = None;
            row.acquired_at = None;
        }
        Ok(())
    }

    async fn release_held_by(&self, conversation_id: &str, owner: &str) -> Result<bool, String> {
        let mut state = self.state.lock().unwrap();
        match state.locks.get_mut(conversation_id) {
            Some(row) if row.owner.as_deref() == Some(owner) => {
                row.owner = None;
                row.acquired_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ConversationLog for InMemoryStorage {
    async fn append(
        &self,
        conversation_id: &str,
        direction: Direction,
        content: &str,
        media_refs: &[String],
        now: DateTime<Utc>,
    ) -> Result<Message, String> {
        if direction == Direction::Outbound && self.fail_outbound.load(Ordering::SeqCst) {
            return Err("disk full".to_string());
        }
        let mut state = self.state.lock().unwrap();
        state.next_message_id += 1;
        let message = Message {
            id: state.next_message_id,
            conversation_id: conversation_id.to_string(),
            direction,
            content: content.to_string(),
            media_refs: media_refs.to_vec(),
            created_at: now,
        };
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>, String> {
        let all = self.messages(conversation_id);
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ============================================================================
// Scripted capability
// ============================================================================

#[derive(Debug, Clone)]
enum Step {
    Chunk(StreamChunk),
    Fail(String),
}

/// Capability that replays a fixed chunk script on every run
pub struct ScriptedCapability {
    script: Vec<Step>,
    delay: Option<Duration>,
    fail_next: Mutex<Option<String>>,
    invocations: AtomicUsize,
    seen_history: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedCapability {
    fn from_steps(script: Vec<Step>) -> Self {
        Self {
            script,
            delay: None,
            fail_next: Mutex::new(None),
            invocations: AtomicUsize::new(0),
            seen_history: Mutex::new(Vec::new()),
        }
    }

    /// One terminal chunk carrying the whole reply
    pub fn replying(text: &str) -> Self {
        Self::from_steps(vec![Step::Chunk(StreamChunk::last(text))])
    }

    /// A terminal chunk that also ends the capability's flow
    pub fn completing(text: &str) -> Self {
        Self::from_steps(vec![Step::Chunk(StreamChunk::last(text).completing_flow())])
    }

    /// Several increments followed by an empty terminal chunk
    pub fn chunks(parts: &[&str]) -> Self {
        let mut script: Vec<Step> = parts
            .iter()
            .map(|p| Step::Chunk(StreamChunk::delta(*p)))
            .collect();
        script.push(Step::Chunk(StreamChunk::last("")));
        Self::from_steps(script)
    }

    /// Increments, then an error instead of the terminal chunk
    pub fn failing_after(parts: &[&str], error: &str) -> Self {
        let mut script: Vec<Step> = parts
            .iter()
            .map(|p| Step::Chunk(StreamChunk::delta(*p)))
            .collect();
        script.push(Step::Fail(error.to_string()));
        Self::from_steps(script)
    }

    /// Increments, then the stream just ends
    pub fn without_final(parts: &[&str]) -> Self {
        Self::from_steps(
            parts
                .iter()
                .map(|p| Step::Chunk(StreamChunk::delta(*p)))
                .collect(),
        )
    }

    /// Sleep before every chunk
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The next run fails immediately
    pub fn fail_next(&self, error: &str) {
        *self.fail_next.lock().unwrap() = Some(error.to_string());
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn seen_history(&self) -> Vec<Vec<Message>> {
        self.seen_history.lock().unwrap().clone()
    }
}

impl CapabilityHandler for ScriptedCapability {
    fn run(&self, history: &[Message], _message: &InboundMessage) -> ChunkStream {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.seen_history.lock().unwrap().push(history.to_vec());

        let script = match self.fail_next.lock().unwrap().take() {
            Some(error) => vec![Step::Fail(error)],
            None => self.script.clone(),
        };
        let delay = self.delay;

        stream::iter(script)
            .then(move |step| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                match step {
                    Step::Chunk(chunk) => Ok(chunk),
                    Step::Fail(error) => Err(CapabilityError::Failed(error)),
                }
            })
            .boxed()
    }
}

// ============================================================================
// Classifier
// ============================================================================

/// Classifier that returns queued answers, then a fixed default
pub struct FixedClassifier {
    default: Capability,
    queue: Mutex<VecDeque<Result<Capability, ClassifyError>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FixedClassifier {
    pub fn new(default: Capability) -> Self {
        Self {
            default,
            queue: Mutex::new(VecDeque::new()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn queue(&self, answer: Result<Capability, ClassifyError>) {
        self.queue.lock().unwrap().push_back(answer);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for FixedClassifier {
    async fn classify(
        &self,
        _message: &InboundMessage,
        _history: &[Message],
    ) -> Result<Capability, ClassifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(self.default));
        // Let concurrent turns interleave here, as a real classifier call would
        match self.delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        answer
    }
}

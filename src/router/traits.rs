//! Trait abstractions for router I/O
//!
//! These traits let the turn executor run against in-memory mocks in tests
//! and against SQLite in production.

use crate::db::{Channel, Conversation, Database, Direction, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Maps transport identities to conversations
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Find or create the party and its conversation. Idempotent under
    /// concurrent first contact.
    async fn resolve(
        &self,
        channel: Channel,
        external_handle: &str,
        now: DateTime<Utc>,
    ) -> Result<Conversation, String>;
}

/// Persisted per-conversation mutual exclusion
#[async_trait]
pub trait SessionLockStore: Send + Sync {
    /// Owner at `now`, or None when unowned or expired
    async fn get_owner(
        &self,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, String>;

    /// Atomic compare-and-set; true only for the caller that took ownership
    async fn try_acquire(
        &self,
        conversation_id: &str,
        capability: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, String>;

    /// Extend the lock; false when `capability` no longer owns it
    async fn refresh(
        &self,
        conversation_id: &str,
        capability: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, String>;

    async fn release(&self, conversation_id: &str) -> Result<(), String>;

    /// Release only while `owner` still holds the lock
    async fn release_held_by(&self, conversation_id: &str, owner: &str) -> Result<bool, String>;
}

/// Append-only message history
#[async_trait]
pub trait ConversationLog: Send + Sync {
    async fn append(
        &self,
        conversation_id: &str,
        direction: Direction,
        content: &str,
        media_refs: &[String],
        now: DateTime<Utc>,
    ) -> Result<Message, String>;

    /// Most recent `limit` messages, oldest first
    async fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>, String>;
}

/// Combined storage trait for convenience
pub trait Storage: IdentityStore + SessionLockStore + ConversationLog {}
impl<T: IdentityStore + SessionLockStore + ConversationLog> Storage for T {}

/// Source of the current time; expiry is always evaluated against it
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: IdentityStore + ?Sized> IdentityStore for Arc<T> {
    async fn resolve(
        &self,
        channel: Channel,
        external_handle: &str,
        now: DateTime<Utc>,
    ) -> Result<Conversation, String> {
        (**self).resolve(channel, external_handle, now).await
    }
}

#[async_trait]
impl<T: SessionLockStore + ?Sized> SessionLockStore for Arc<T> {
    async fn get_owner(
        &self,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, String> {
        (**self).get_owner(conversation_id, now).await
    }

    async fn try_acquire(
        &self,
        conversation_id: &str,
        capability: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, String> {
        (**self)
            .try_acquire(conversation_id, capability, ttl_seconds, now)
            .await
    }

    async fn refresh(
        &self,
        conversation_id: &str,
        capability: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, String> {
        (**self)
            .refresh(conversation_id, capability, ttl_seconds, now)
            .await
    }

    async fn release(&self, conversation_id: &str) -> Result<(), String> {
        (**self).release(conversation_id).await
    }

    async fn release_held_by(&self, conversation_id: &str, owner: &str) -> Result<bool, String> {
        (**self).release_held_by(conversation_id, owner).await
    }
}

#[async_trait]
impl<T: ConversationLog + ?Sized> ConversationLog for Arc<T> {
    async fn append(
        &self,
        conversation_id: &str,
        direction: Direction,
        content: &str,
        media_refs: &[String],
        now: DateTime<Utc>,
    ) -> Result<Message, String> {
        (**self)
            .append(conversation_id, direction, content, media_refs, now)
            .await
    }

    async fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>, String> {
        (**self).recent(conversation_id, limit).await
    }
}

// ============================================================================
// Production Adapter
// ============================================================================

/// Adapter to use Database as Storage
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl IdentityStore for DatabaseStorage {
    async fn resolve(
        &self,
        channel: Channel,
        external_handle: &str,
        now: DateTime<Utc>,
    ) -> Result<Conversation, String> {
        self.db
            .resolve_identity(channel, external_handle, now)
            .map(|(_, conversation)| conversation)
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl SessionLockStore for DatabaseStorage {
    async fn get_owner(
        &self,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, String> {
        self.db
            .lock_owner(conversation_id, now)
            .map_err(|e| e.to_string())
    }

    async fn try_acquire(
        &self,
        conversation_id: &str,
        capability: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, String> {
        self.db
            .try_acquire_lock(conversation_id, capability, ttl_seconds, now)
            .map_err(|e| e.to_string())
    }

    async fn refresh(
        &self,
        conversation_id: &str,
        capability: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, String> {
        self.db
            .refresh_lock(conversation_id, capability, ttl_seconds, now)
            .map_err(|e| e.to_string())
    }

    async fn release(&self, conversation_id: &str) -> Result<(), String> {
        self.db
            .release_lock(conversation_id)
            .map_err(|e| e.to_string())
    }

    async fn release_held_by(&self, conversation_id: &str, owner: &str) -> Result<bool, String> {
        self.db
            .release_lock_held_by(conversation_id, owner)
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl ConversationLog for DatabaseStorage {
    async fn append(
        &self,
        conversation_id: &str,
        direction: Direction,
        content: &str,
        media_refs: &[String],
        now: DateTime<Utc>,
    ) -> Result<Message, String> {
        self.db
            .append_message(conversation_id, direction, content, media_refs, now)
            .map_err(|e| e.to_string())
    }

    async fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>, String> {
        self.db
            .recent_messages(conversation_id, limit)
            .map_err(|e| e.to_string())
    }
}

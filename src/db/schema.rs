//! Database schema and types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS party (
    id TEXT PRIMARY KEY,
    channel TEXT NOT NULL,
    external_handle TEXT NOT NULL,
    created_at TEXT NOT NULL,

    UNIQUE (channel, external_handle)
);

CREATE TABLE IF NOT EXISTS conversation (
    id TEXT PRIMARY KEY,
    party_id TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL,

    FOREIGN KEY (party_id) REFERENCES party(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS session_lock (
    conversation_id TEXT PRIMARY KEY,
    owning_capability TEXT,
    acquired_at_ms INTEGER,
    ttl_seconds INTEGER NOT NULL DEFAULT 86400,

    FOREIGN KEY (conversation_id) REFERENCES conversation(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS message (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    direction TEXT NOT NULL CHECK (direction IN ('inbound', 'outbound')),
    content TEXT NOT NULL,
    media_refs TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversation(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_message_conversation ON message(conversation_id, created_at, id);
";

/// Default session lock lifetime
pub const DEFAULT_LOCK_TTL_SECS: i64 = 86_400;

/// Transport a party reaches us through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    MessagingGateway,
    WebChat,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::MessagingGateway => "messaging_gateway",
            Channel::WebChat => "web_chat",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "messaging_gateway" => Ok(Channel::MessagingGateway),
            "web_chat" => Ok(Channel::WebChat),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// Durable identity of a human participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Party {
    pub id: String,
    pub channel: Channel,
    pub external_handle: String,
    pub created_at: DateTime<Utc>,
}

/// Conversation record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub party_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Persisted coordination record for one conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLock {
    pub conversation_id: String,
    pub owning_capability: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub ttl_seconds: i64,
}

impl SessionLock {
    /// Instant after which the lock no longer counts as held
    #[allow(dead_code)] // Used in tests
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.acquired_at
            .map(|at| at + chrono::Duration::seconds(self.ttl_seconds))
    }

    /// Owner as seen at `now`; an expired lock has no owner even if the
    /// row still names one.
    #[allow(dead_code)] // Used in tests
    pub fn owner_at(&self, now: DateTime<Utc>) -> Option<&str> {
        let expires_at = self.expires_at()?;
        if now > expires_at {
            return None;
        }
        self.owning_capability.as_deref()
    }
}

/// Message direction relative to the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// One logged turn. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: String,
    pub direction: Direction,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_refs: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn lock_at(acquired: Option<DateTime<Utc>>, owner: Option<&str>) -> SessionLock {
        SessionLock {
            conversation_id: "conv-1".to_string(),
            owning_capability: owner.map(String::from),
            acquired_at: acquired,
            ttl_seconds: DEFAULT_LOCK_TTL_SECS,
        }
    }

    #[test]
    fn test_owner_at_respects_ttl_boundary() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let lock = lock_at(Some(t), Some("scheduling"));

        assert_eq!(lock.owner_at(t), Some("scheduling"));
        assert_eq!(
            lock.owner_at(t + chrono::Duration::seconds(DEFAULT_LOCK_TTL_SECS)),
            Some("scheduling")
        );
        assert_eq!(
            lock.owner_at(t + chrono::Duration::seconds(DEFAULT_LOCK_TTL_SECS + 1)),
            None
        );
    }

    #[test]
    fn test_unacquired_lock_has_no_owner() {
        let lock = lock_at(None, None);
        assert_eq!(lock.owner_at(Utc::now()), None);
        assert!(lock.expires_at().is_none());
    }

    #[test]
    fn test_channel_round_trips_through_str() {
        for channel in [Channel::MessagingGateway, Channel::WebChat] {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
        assert!("sms".parse::<Channel>().is_err());
    }
}

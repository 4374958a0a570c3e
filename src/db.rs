//! Database module for the intake desk
//!
//! Provides persistence for parties, conversations, session locks and the
//! conversation log. Every mutation that other handler processes can race
//! on is a single conditional statement; nothing here reads a row and then
//! writes it back from application code.

mod schema;

pub use schema::*;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Record vanished after conflicting insert: {0}")]
    VanishedRecord(String),
}

pub type DbResult<T> = Result<T, DbError>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MESSAGE_COLUMNS: &str = "id, conversation_id, direction, content, media_refs, created_at";

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // Several handler processes may share one file
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "Configured journal mode");
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Identity Operations ====================

    /// Map a transport identity to its party and conversation, creating
    /// both on first contact.
    ///
    /// Concurrent first contacts are settled by the unique constraints: the
    /// loser of an insert race reads the winner's row instead.
    pub fn resolve_identity(
        &self,
        channel: Channel,
        external_handle: &str,
        now: DateTime<Utc>,
    ) -> DbResult<(Party, Conversation)> {
        let conn = self.conn();

        let party = match find_party(&conn, channel, external_handle)? {
            Some(party) => party,
            None => {
                let party = Party {
                    id: uuid::Uuid::new_v4().to_string(),
                    channel,
                    external_handle: external_handle.to_string(),
                    created_at: now,
                };
                let inserted = conn.execute(
                    "INSERT INTO party (id, channel, external_handle, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![party.id, channel.as_str(), external_handle, format_datetime(&now)],
                );
                match inserted {
                    Ok(_) => {
                        tracing::info!(party_id = %party.id, %channel, "Created party");
                        party
                    }
                    Err(e) if is_unique_violation(&e) => {
                        tracing::debug!(%channel, "Lost party insert race, reading winner");
                        find_party(&conn, channel, external_handle)?.ok_or_else(|| {
                            DbError::VanishedRecord(format!("party {channel}/{external_handle}"))
                        })?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let conversation = match find_conversation_for_party(&conn, &party.id)? {
            Some(conversation) => conversation,
            None => {
                let conversation = Conversation {
                    id: uuid::Uuid::new_v4().to_string(),
                    party_id: party.id.clone(),
                    created_at: now,
                    last_activity_at: now,
                };
                let inserted = conn.execute(
                    "INSERT INTO conversation (id, party_id, created_at, last_activity_at) VALUES (?1, ?2, ?3, ?3)",
                    params![conversation.id, party.id, format_datetime(&now)],
                );
                match inserted {
                    Ok(_) => conversation,
                    Err(e) if is_unique_violation(&e) => {
                        find_conversation_for_party(&conn, &party.id)?.ok_or_else(|| {
                            DbError::VanishedRecord(format!("conversation of party {}", party.id))
                        })?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        conn.execute(
            "INSERT OR IGNORE INTO session_lock (conversation_id, ttl_seconds) VALUES (?1, ?2)",
            params![conversation.id, DEFAULT_LOCK_TTL_SECS],
        )?;

        Ok((party, conversation))
    }

    /// Get conversation by ID
    pub fn get_conversation(&self, id: &str) -> DbResult<Conversation> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, party_id, created_at, last_activity_at FROM conversation WHERE id = ?1",
            params![id],
            parse_conversation_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::ConversationNotFound(id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    /// Look up a party without creating it
    #[allow(dead_code)] // Used in tests
    pub fn get_party(&self, channel: Channel, external_handle: &str) -> DbResult<Option<Party>> {
        let conn = self.conn();
        find_party(&conn, channel, external_handle)
    }

    /// Count parties (for tests and diagnostics)
    #[allow(dead_code)] // Used in tests
    pub fn count_parties(&self) -> DbResult<i64> {
        let conn = self.conn();
        conn.query_row("SELECT COUNT(*) FROM party", [], |row| row.get(0))
            .map_err(DbError::from)
    }

    /// Erase a party and, by cascade, its conversation, lock and messages.
    /// Returns false if no such party existed.
    pub fn erase_party(&self, channel: Channel, external_handle: &str) -> DbResult<bool> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM party WHERE channel = ?1 AND external_handle = ?2",
            params![channel.as_str(), external_handle],
        )?;
        Ok(deleted > 0)
    }

    // ==================== Session Lock Operations ====================

    /// Current owner of the conversation, or None when unowned or expired.
    /// Expiry is evaluated against `now`, never swept.
    pub fn lock_owner(&self, conversation_id: &str, now: DateTime<Utc>) -> DbResult<Option<String>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT owning_capability FROM session_lock
             WHERE conversation_id = ?1
               AND owning_capability IS NOT NULL
               AND acquired_at_ms IS NOT NULL
               AND acquired_at_ms + ttl_seconds * 1000 >= ?2",
            params![conversation_id, now.timestamp_millis()],
            |row| row.get(0),
        )
        .optional()
        .map_err(DbError::from)
    }

    /// Take ownership if the lock is unowned or expired. One statement:
    /// the upsert's `WHERE` is the compare, its `SET` the swap.
    pub fn try_acquire_lock(
        &self,
        conversation_id: &str,
        capability: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "INSERT INTO session_lock (conversation_id, owning_capability, acquired_at_ms, ttl_seconds)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(conversation_id) DO UPDATE SET
                 owning_capability = excluded.owning_capability,
                 acquired_at_ms = excluded.acquired_at_ms,
                 ttl_seconds = excluded.ttl_seconds
             WHERE session_lock.owning_capability IS NULL
                OR session_lock.acquired_at_ms IS NULL
                OR session_lock.acquired_at_ms + session_lock.ttl_seconds * 1000 < excluded.acquired_at_ms",
            params![conversation_id, capability, now.timestamp_millis(), ttl_seconds],
        )?;
        Ok(changed > 0)
    }

    /// Extend a held lock. Fails (returns false) unless `capability` still
    /// owns it and it has not expired.
    pub fn refresh_lock(
        &self,
        conversation_id: &str,
        capability: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE session_lock SET acquired_at_ms = ?3, ttl_seconds = ?4
             WHERE conversation_id = ?1
               AND owning_capability = ?2
               AND acquired_at_ms IS NOT NULL
               AND acquired_at_ms + ttl_seconds * 1000 >= ?3",
            params![conversation_id, capability, now.timestamp_millis(), ttl_seconds],
        )?;
        Ok(changed > 0)
    }

    /// Unconditionally clear the owner
    pub fn release_lock(&self, conversation_id: &str) -> DbResult<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE session_lock SET owning_capability = NULL, acquired_at_ms = NULL
             WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(())
    }

    /// Clear the owner only if it is still `owner`. Returns whether a row
    /// changed, so concurrent callers see exactly one eviction.
    pub fn release_lock_held_by(&self, conversation_id: &str, owner: &str) -> DbResult<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE session_lock SET owning_capability = NULL, acquired_at_ms = NULL
             WHERE conversation_id = ?1 AND owning_capability = ?2",
            params![conversation_id, owner],
        )?;
        Ok(changed > 0)
    }

    /// Full lock record, for operator views
    pub fn session_lock(&self, conversation_id: &str) -> DbResult<SessionLock> {
        let conn = self.conn();
        conn.query_row(
            "SELECT conversation_id, owning_capability, acquired_at_ms, ttl_seconds
             FROM session_lock WHERE conversation_id = ?1",
            params![conversation_id],
            |row| {
                let acquired_at_ms: Option<i64> = row.get(2)?;
                Ok(SessionLock {
                    conversation_id: row.get(0)?,
                    owning_capability: row.get(1)?,
                    acquired_at: acquired_at_ms.and_then(DateTime::from_timestamp_millis),
                    ttl_seconds: row.get(3)?,
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                DbError::ConversationNotFound(conversation_id.to_string())
            }
            other => DbError::Sqlite(other),
        })
    }

    /// Physically clear locks that are already logically expired.
    /// Housekeeping only; readers never depend on it.
    pub fn sweep_expired_locks(&self, now: DateTime<Utc>) -> DbResult<usize> {
        let conn = self.conn();
        let cleared = conn.execute(
            "UPDATE session_lock SET owning_capability = NULL, acquired_at_ms = NULL
             WHERE owning_capability IS NOT NULL
               AND (acquired_at_ms IS NULL OR acquired_at_ms + ttl_seconds * 1000 < ?1)",
            params![now.timestamp_millis()],
        )?;
        Ok(cleared)
    }

    // ==================== Message Operations ====================

    /// Append one message to the conversation log
    pub fn append_message(
        &self,
        conversation_id: &str,
        direction: Direction,
        content: &str,
        media_refs: &[String],
        now: DateTime<Utc>,
    ) -> DbResult<Message> {
        let conn = self.conn();
        let created_at = format_datetime(&now);
        let media_json = serde_json::to_string(media_refs).unwrap_or_else(|_| "[]".to_string());

        conn.execute(
            "INSERT INTO message (conversation_id, direction, content, media_refs, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![conversation_id, direction.as_str(), content, media_json, created_at],
        )?;
        let id = conn.last_insert_rowid();

        conn.execute(
            "UPDATE conversation SET last_activity_at = ?1 WHERE id = ?2 AND last_activity_at < ?1",
            params![created_at, conversation_id],
        )?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            direction,
            content: content.to_string(),
            media_refs: media_refs.to_vec(),
            created_at: now,
        })
    }

    /// The most recent `limit` messages, oldest first
    pub fn recent_messages(&self, conversation_id: &str, limit: usize) -> DbResult<Vec<Message>> {
        let conn = self.conn();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM (
                 SELECT {MESSAGE_COLUMNS} FROM message WHERE conversation_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2
             ) ORDER BY created_at ASC, id ASC"
        ))?;

        let rows = stmt.query_map(params![conversation_id, limit], parse_message_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Get all messages for a conversation, oldest first
    pub fn get_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message WHERE conversation_id = ?1 ORDER BY created_at ASC, id ASC"
        ))?;

        let rows = stmt.query_map(params![conversation_id], parse_message_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }
}

fn find_party(conn: &Connection, channel: Channel, external_handle: &str) -> DbResult<Option<Party>> {
    conn.query_row(
        "SELECT id, channel, external_handle, created_at FROM party
         WHERE channel = ?1 AND external_handle = ?2",
        params![channel.as_str(), external_handle],
        |row| {
            Ok(Party {
                id: row.get(0)?,
                channel: parse_column(row, 1)?,
                external_handle: row.get(2)?,
                created_at: parse_datetime(&row.get::<_, String>(3)?),
            })
        },
    )
    .optional()
    .map_err(DbError::from)
}

fn find_conversation_for_party(conn: &Connection, party_id: &str) -> DbResult<Option<Conversation>> {
    conn.query_row(
        "SELECT id, party_id, created_at, last_activity_at FROM conversation WHERE party_id = ?1",
        params![party_id],
        parse_conversation_row,
    )
    .optional()
    .map_err(DbError::from)
}

fn parse_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        party_id: row.get(1)?,
        created_at: parse_datetime(&row.get::<_, String>(2)?),
        last_activity_at: parse_datetime(&row.get::<_, String>(3)?),
    })
}

/// Parse a message row from the database
fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let media_json: String = row.get(4)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        direction: parse_column(row, 2)?,
        content: row.get(3)?,
        media_refs: serde_json::from_str(&media_json).unwrap_or_default(),
        created_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn parse_column<T: FromStr<Err = String>>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Fixed-width UTC timestamps so text ordering matches time ordering
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

//! Session and message persistence.
//!
//! Conversations are stored as an append-only sequence of messages per
//! session. A session is bound to one skill for its whole lifetime; message
//! order within a session is `(created_at, id)` ascending and is never
//! rewritten. Feedback is the one mutable piece: a ±1 vote keyed by
//! assistant message id, where re-submitting overrides the previous value.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Db;
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// A conversation session bound to a single skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    /// Unique identifier (UUID v7).
    pub id: String,
    /// The skill this session is bound to.
    pub skill: String,
    /// Unix timestamp when the session was created.
    pub created_at: i64,
    /// Unix timestamp of the most recent append.
    pub last_used_at: i64,
}

/// A single persisted message within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Auto-incrementing row ID.
    pub id: i64,
    /// The session this message belongs to.
    pub session_id: String,
    /// Message role: `system`, `user`, `assistant`, or `tool`.
    pub role: String,
    /// Message text. For tool messages this is the serialized tool result.
    pub content: String,
    /// JSON-serialized tool calls (assistant messages only).
    pub tool_calls_json: Option<String>,
    /// The originating tool call id (tool messages only).
    pub tool_call_id: Option<String>,
    /// Unix timestamp when the message was appended.
    pub created_at: i64,
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        tool_calls_json: row.get(4)?,
        tool_call_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredSession> {
    Ok(StoredSession {
        id: row.get(0)?,
        skill: row.get(1)?,
        created_at: row.get(2)?,
        last_used_at: row.get(3)?,
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  MessageStore
// ═══════════════════════════════════════════════════════════════════════

/// Append-only persistence for sessions, messages, and feedback.
#[derive(Clone)]
pub struct MessageStore {
    db: Db,
}

impl MessageStore {
    /// Create a new message store backed by `db`.
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a new session bound to `skill`.
    #[instrument(skip(self))]
    pub async fn create_session(&self, skill: &str) -> StoreResult<StoredSession> {
        let id = Uuid::now_v7().to_string();
        let skill = skill.to_string();
        let now = Utc::now().timestamp();

        let session = StoredSession {
            id: id.clone(),
            skill: skill.clone(),
            created_at: now,
            last_used_at: now,
        };

        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (id, skill, created_at, last_used_at) VALUES (?1, ?2, ?3, ?3)",
                    rusqlite::params![id, skill, now],
                )?;
                Ok(())
            })
            .await?;

        debug!(session_id = %session.id, "session created");
        Ok(session)
    }

    /// Fetch a single session by ID.
    #[instrument(skip(self))]
    pub async fn get_session(&self, id: &str) -> StoreResult<StoredSession> {
        let id = id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, skill, created_at, last_used_at FROM sessions WHERE id = ?1",
                    rusqlite::params![id],
                    row_to_session,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                        entity: "session",
                        id: id.clone(),
                    },
                    other => StoreError::Sqlite(other),
                })
            })
            .await
    }

    /// List sessions ordered by most recently used, optionally filtered by
    /// skill.
    #[instrument(skip(self))]
    pub async fn list_sessions(
        &self,
        skill: Option<&str>,
        limit: u32,
    ) -> StoreResult<Vec<StoredSession>> {
        let skill = skill.map(|s| s.to_string());
        self.db
            .with_conn(move |conn| {
                let rows = match &skill {
                    Some(skill) => {
                        let mut stmt = conn.prepare(
                            "SELECT id, skill, created_at, last_used_at FROM sessions \
                             WHERE skill = ?1 ORDER BY last_used_at DESC, id DESC LIMIT ?2",
                        )?;
                        stmt.query_map(rusqlite::params![skill, limit], row_to_session)?
                            .collect::<Result<Vec<_>, _>>()?
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT id, skill, created_at, last_used_at FROM sessions \
                             ORDER BY last_used_at DESC, id DESC LIMIT ?1",
                        )?;
                        stmt.query_map(rusqlite::params![limit], row_to_session)?
                            .collect::<Result<Vec<_>, _>>()?
                    }
                };
                Ok(rows)
            })
            .await
    }

    /// Count all sessions.
    pub async fn count_sessions(&self) -> StoreResult<i64> {
        self.db
            .with_conn(|conn| {
                let count: i64 =
                    conn.query_row("SELECT count(*) FROM sessions", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
    }

    /// Append a message to a session and bump its `last_used_at`.
    ///
    /// Returns the new message's row ID.
    #[instrument(skip(self, content, tool_calls_json, tool_call_id))]
    pub async fn append(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        tool_calls_json: Option<&str>,
        tool_call_id: Option<&str>,
    ) -> StoreResult<i64> {
        let session_id = session_id.to_string();
        let role = role.to_string();
        let content = content.to_string();
        let tool_calls_json = tool_calls_json.map(|s| s.to_string());
        let tool_call_id = tool_call_id.map(|s| s.to_string());
        let now = Utc::now().timestamp();

        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO messages (session_id, role, content, tool_calls_json, tool_call_id, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![session_id, role, content, tool_calls_json, tool_call_id, now],
                )?;
                let msg_id = conn.last_insert_rowid();

                conn.execute(
                    "UPDATE sessions SET last_used_at = ?2 WHERE id = ?1",
                    rusqlite::params![session_id, now],
                )?;

                Ok(msg_id)
            })
            .await
    }

    /// Return all messages of a session in append order.
    #[instrument(skip(self))]
    pub async fn list(&self, session_id: &str) -> StoreResult<Vec<StoredMessage>> {
        let session_id = session_id.to_string();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, role, content, tool_calls_json, tool_call_id, created_at \
                     FROM messages WHERE session_id = ?1 ORDER BY created_at ASC, id ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![session_id], row_to_message)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Record feedback on an assistant message.
    ///
    /// `value` must be `+1` or `-1`. Re-submitting for the same message
    /// overrides the stored value; submitting the same value twice is a
    /// no-op.
    #[instrument(skip(self))]
    pub async fn set_feedback(&self, message_id: i64, value: i32) -> StoreResult<()> {
        if value != 1 && value != -1 {
            return Err(StoreError::InvalidArgument(format!(
                "feedback value must be +1 or -1, got {value}"
            )));
        }

        let now = Utc::now().timestamp();
        self.db
            .with_conn(move |conn| {
                let role: String = conn
                    .query_row(
                        "SELECT role FROM messages WHERE id = ?1",
                        [message_id],
                        |row| row.get(0),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                            entity: "message",
                            id: message_id.to_string(),
                        },
                        other => StoreError::Sqlite(other),
                    })?;

                if role != "assistant" {
                    return Err(StoreError::InvalidArgument(format!(
                        "feedback applies to assistant messages, message {message_id} is `{role}`"
                    )));
                }

                conn.execute(
                    "INSERT INTO feedback (message_id, value, created_at) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(message_id) DO UPDATE SET value = ?2, created_at = ?3",
                    rusqlite::params![message_id, value, now],
                )?;
                Ok(())
            })
            .await
    }

    /// Return the feedback value for a message, if any.
    pub async fn get_feedback(&self, message_id: i64) -> StoreResult<Option<i32>> {
        self.db
            .with_conn(move |conn| {
                let result = conn.query_row(
                    "SELECT value FROM feedback WHERE message_id = ?1",
                    [message_id],
                    |row| row.get::<_, i32>(0),
                );
                match result {
                    Ok(v) => Ok(Some(v)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> MessageStore {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        MessageStore::new(db)
    }

    #[tokio::test]
    async fn create_and_get_session() {
        let store = setup().await;

        let session = store.create_session("research").await.unwrap();
        assert_eq!(session.skill, "research");

        let fetched = store.get_session(&session.id).await.unwrap();
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.skill, "research");
    }

    #[tokio::test]
    async fn get_unknown_session_is_not_found() {
        let store = setup().await;
        let result = store.get_session("nope").await;
        match result.unwrap_err() {
            StoreError::NotFound { entity, .. } => assert_eq!(entity, "session"),
            other => panic!("expected NotFound, got: {other}"),
        }
    }

    #[tokio::test]
    async fn append_preserves_order() {
        let store = setup().await;
        let session = store.create_session("chat").await.unwrap();

        store
            .append(&session.id, "user", "hello", None, None)
            .await
            .unwrap();
        store
            .append(
                &session.id,
                "assistant",
                "",
                Some(r#"[{"id":"tc_1","name":"add","arguments":{"a":2,"b":3}}]"#),
                None,
            )
            .await
            .unwrap();
        store
            .append(&session.id, "tool", "5", None, Some("tc_1"))
            .await
            .unwrap();
        store
            .append(&session.id, "assistant", "the answer is 5", None, None)
            .await
            .unwrap();

        let messages = store.list(&session.id).await.unwrap();
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["user", "assistant", "tool", "assistant"]);
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("tc_1"));
        assert!(messages[1].tool_calls_json.is_some());

        // Appends are strictly ordered by id.
        let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn append_bumps_last_used() {
        let store = setup().await;
        let session = store.create_session("chat").await.unwrap();

        store
            .append(&session.id, "user", "hi", None, None)
            .await
            .unwrap();

        let updated = store.get_session(&session.id).await.unwrap();
        assert!(updated.last_used_at >= session.last_used_at);
    }

    #[tokio::test]
    async fn list_sessions_filters_by_skill() {
        let store = setup().await;
        store.create_session("alpha").await.unwrap();
        store.create_session("alpha").await.unwrap();
        store.create_session("beta").await.unwrap();

        let all = store.list_sessions(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);

        let alpha = store.list_sessions(Some("alpha"), 10).await.unwrap();
        assert_eq!(alpha.len(), 2);
        assert!(alpha.iter().all(|s| s.skill == "alpha"));

        assert_eq!(store.count_sessions().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn feedback_is_idempotent_and_overridable() {
        let store = setup().await;
        let session = store.create_session("chat").await.unwrap();
        let msg_id = store
            .append(&session.id, "assistant", "hi", None, None)
            .await
            .unwrap();

        store.set_feedback(msg_id, 1).await.unwrap();
        store.set_feedback(msg_id, 1).await.unwrap();
        assert_eq!(store.get_feedback(msg_id).await.unwrap(), Some(1));

        store.set_feedback(msg_id, -1).await.unwrap();
        assert_eq!(store.get_feedback(msg_id).await.unwrap(), Some(-1));
    }

    #[tokio::test]
    async fn feedback_rejects_bad_values_and_targets() {
        let store = setup().await;
        let session = store.create_session("chat").await.unwrap();
        let user_msg = store
            .append(&session.id, "user", "hi", None, None)
            .await
            .unwrap();

        assert!(store.set_feedback(user_msg, 1).await.is_err());
        assert!(store.set_feedback(999_999, 1).await.is_err());

        let assistant_msg = store
            .append(&session.id, "assistant", "yo", None, None)
            .await
            .unwrap();
        assert!(store.set_feedback(assistant_msg, 0).await.is_err());
        assert!(store.set_feedback(assistant_msg, 2).await.is_err());
    }
}

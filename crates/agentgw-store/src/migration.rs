//! Schema migration system.
//!
//! Migrations are static SQL strings keyed by version number. The applied
//! version set is tracked in a `_migrations` table so running them is
//! idempotent. Add new migrations to the end of the array only.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// A single migration definition.
struct Migration {
    /// Monotonically increasing version number (1, 2, 3, ...).
    version: u32,
    /// Human-readable description.
    description: &'static str,
    /// Raw SQL. May contain multiple statements separated by `;`.
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "initial schema: sessions, messages, feedback, chunks",
    sql: r#"
        CREATE TABLE sessions (
            id           TEXT PRIMARY KEY,
            skill        TEXT NOT NULL,
            created_at   INTEGER NOT NULL,
            last_used_at INTEGER NOT NULL
        );
        CREATE INDEX idx_sessions_skill ON sessions(skill);
        CREATE INDEX idx_sessions_last_used ON sessions(last_used_at);

        CREATE TABLE messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id      TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            role            TEXT NOT NULL CHECK(role IN ('system','user','assistant','tool')),
            content         TEXT NOT NULL,
            tool_calls_json TEXT,
            tool_call_id    TEXT,
            created_at      INTEGER NOT NULL
        );
        CREATE INDEX idx_messages_session ON messages(session_id);

        CREATE TABLE feedback (
            message_id  INTEGER PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
            value       INTEGER NOT NULL CHECK(value IN (-1, 1)),
            created_at  INTEGER NOT NULL
        );

        CREATE TABLE chunks (
            id           TEXT PRIMARY KEY,
            collection   TEXT NOT NULL,
            source       TEXT NOT NULL,
            chunk_index  INTEGER NOT NULL,
            total_chunks INTEGER NOT NULL,
            text         TEXT NOT NULL,
            embedding    BLOB NOT NULL,
            skills       TEXT NOT NULL,
            tags         TEXT NOT NULL,
            created_at   INTEGER NOT NULL
        );
        CREATE INDEX idx_chunks_collection ON chunks(collection);
        CREATE INDEX idx_chunks_source ON chunks(source);
    "#,
}];

/// Run all migrations that have not been applied yet.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )?;

    for migration in MIGRATIONS {
        let applied: bool = conn
            .query_row(
                "SELECT count(*) FROM _migrations WHERE version = ?1",
                [migration.version],
                |row| row.get::<_, i64>(0),
            )
            .map(|c| c > 0)?;

        if applied {
            debug!(version = migration.version, "migration already applied");
            continue;
        }

        info!(
            version = migration.version,
            description = migration.description,
            "applying migration"
        );

        conn.execute_batch(migration.sql)
            .map_err(|e| StoreError::Migration {
                version: migration.version,
                message: e.to_string(),
            })?;

        conn.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                migration.version,
                migration.description,
                chrono::Utc::now().timestamp()
            ],
        )?;
    }

    Ok(())
}

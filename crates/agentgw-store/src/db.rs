//! Shared SQLite handle.
//!
//! Everything durable in the daemon (sessions, messages, feedback, chunks)
//! lives in one SQLite file owned by a single connection. [`Db`] hides that
//! connection behind a closure-passing API: callers hand [`Db::with_conn`] a
//! closure and it runs on tokio's blocking pool, so store calls never stall
//! the event loop.
//!
//! One shared connection is deliberate. The service layer already
//! serializes writers per session, WAL keeps readers off the write lock,
//! and a second connection would buy contention on the file instead of
//! throughput.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Path sentinel selecting a transient in-process database.
pub const MEMORY_DB: &str = ":memory:";

/// Cloneable handle to the daemon's SQLite database.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open the database at `path`, creating the file if missing. The
    /// [`MEMORY_DB`] sentinel opens a transient in-process database
    /// instead, which is how `db_path = ":memory:"` configs run.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if path.as_os_str() == MEMORY_DB {
            return Self::open_in_memory();
        }
        info!(path = %path.display(), "opening database");
        Self::from_connection(Connection::open(path)?)
    }

    /// Open a transient in-process database.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        tune(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Bring the schema up to date. Idempotent; runs at every startup.
    pub async fn migrate(&self) -> StoreResult<()> {
        self.with_conn(migration::run_all).await
    }

    /// Run `f` against the connection on the blocking pool.
    ///
    /// Every query in this crate goes through here. The mutex makes the
    /// handle safe to clone across tasks; a poisoned mutex (a panic inside
    /// an earlier closure) surfaces as [`StoreError::TaskJoin`].
    pub async fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("connection mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }
}

/// Per-connection tuning.
fn tune(conn: &Connection) -> StoreResult<()> {
    // FK enforcement is off by default in SQLite; messages → sessions and
    // feedback → messages rely on it.
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // WAL lets vector searches keep reading while a loop appends messages.
    // NORMAL sync is safe under WAL: a power cut can lose the last
    // transaction but cannot corrupt the file.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;

    // When two tasks race a write, wait it out instead of erroring.
    conn.pragma_update(None, "busy_timeout", 5_000_i32)?;

    Ok(())
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sentinel_opens_a_transient_database() {
        let db = Db::open(MEMORY_DB).unwrap();
        db.migrate().await.unwrap();

        let chunks: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT count(*) FROM chunks", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(chunks, 0);
    }

    #[tokio::test]
    async fn file_backed_database_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentgw.db");

        {
            let db = Db::open(&path).unwrap();
            db.migrate().await.unwrap();
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO sessions (id, skill, created_at, last_used_at) \
                     VALUES ('s1', 'echo', 0, 0)",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        }

        // A fresh handle over the same file sees the earlier write.
        let db = Db::open(&path).unwrap();
        db.migrate().await.unwrap();
        let skill: String = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT skill FROM sessions WHERE id = 's1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(skill, "echo");
    }

    #[tokio::test]
    async fn migrate_twice_is_a_noop() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();

        // A message pointing at a session that does not exist must fail.
        let result = db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO messages (session_id, role, content, created_at) \
                     VALUES ('ghost', 'user', 'x', 0)",
                    [],
                )?;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::Sqlite(_))));
    }
}

//! The durable backing store abstraction. Narrower than a general session
//! store — this crate only ever needs one operation, append-with-dedup —
//! but documented in the same "what are the concurrency guarantees"
//! register the rest of the workspace uses for its storage traits.

use async_trait::async_trait;
use panelstream_core::PersistenceError;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex as AsyncMutex;

/// The result of one `append_chunk` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The row was newly written.
    Appended,
    /// A row with this `(thread_id, message_id, seq)` already existed;
    /// this call was a no-op, by design (at-least-once delivery makes
    /// redelivery routine, not exceptional).
    Deduplicated,
}

/// Durable storage for persisted chunks, keyed by `(thread_id, message_id,
/// seq)`.
///
/// # Concurrency model
///
/// Implementations must be safe to call concurrently from multiple
/// Persistence Pipeline workers for *different* `(thread_id, message_id)`
/// pairs. Concurrent appends for the *same* key must not corrupt
/// dedup/ordering — a unique constraint on `(thread_id, message_id, seq)`
/// at the storage layer, rather than an in-process lock, is the intended
/// mechanism (this is what `SqliteStore` does).
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append_chunk(
        &self,
        thread_id: &str,
        message_id: &str,
        seq: u64,
        kind: &str,
        content: &serde_json::Value,
        finalized: bool,
        created_at: &str,
    ) -> Result<AppendOutcome, PersistenceError>;

    /// Concatenates every `text`/`thinking` chunk's `delta` for a message,
    /// in `seq` order, and reports whether a `finalized=true` record has
    /// been observed. Used by the persistence round-trip property: a
    /// finalized message's full text must equal the terminal chunk's
    /// `fullContent` field.
    async fn read_full_content(
        &self,
        thread_id: &str,
        message_id: &str,
    ) -> Result<(String, bool), PersistenceError>;
}

/// A `rusqlite`-backed `MessageStore`. `rusqlite::Connection` is `!Sync`,
/// so access is serialized behind a `tokio::sync::Mutex` — acceptable here
/// because SQLite itself serializes writers anyway; the mutex just avoids
/// spurious `SQLITE_BUSY` retries under worker-pool concurrency.
pub struct SqliteStore {
    conn: AsyncMutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &std::path::Path) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)
            .map_err(|e| PersistenceError::StoreUnavailable(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(SqliteStore {
            conn: AsyncMutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PersistenceError::StoreUnavailable(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(SqliteStore {
            conn: AsyncMutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), PersistenceError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chunks (
                thread_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                finalized INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (thread_id, message_id, seq)
            );
            CREATE TABLE IF NOT EXISTS message_state (
                thread_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                finalized INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (thread_id, message_id)
            );",
        )
        .map_err(|e| PersistenceError::StoreUnavailable(e.to_string()))
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append_chunk(
        &self,
        thread_id: &str,
        message_id: &str,
        seq: u64,
        kind: &str,
        content: &serde_json::Value,
        finalized: bool,
        created_at: &str,
    ) -> Result<AppendOutcome, PersistenceError> {
        let conn = self.conn.lock().await;

        // Once a message record has been finalized, every further append
        // for that (thread_id, message_id) is a dedup, per spec.md §6 —
        // regardless of whether this exact seq was ever written before.
        let already_finalized: bool = conn
            .query_row(
                "SELECT finalized FROM message_state WHERE thread_id = ?1 AND message_id = ?2",
                rusqlite::params![thread_id, message_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| PersistenceError::StoreUnavailable(e.to_string()))?
            .map(|v| v != 0)
            .unwrap_or(false);

        if already_finalized {
            return Ok(AppendOutcome::Deduplicated);
        }

        let content_text = content.to_string();
        let rows = conn
            .execute(
                "INSERT OR IGNORE INTO chunks (thread_id, message_id, seq, kind, content, finalized, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    thread_id,
                    message_id,
                    seq as i64,
                    kind,
                    content_text,
                    finalized as i64,
                    created_at
                ],
            )
            .map_err(|e| PersistenceError::StoreRejected {
                thread_id: thread_id.to_string(),
                message_id: message_id.to_string(),
                seq,
                reason: e.to_string(),
            })?;

        if finalized {
            conn.execute(
                "INSERT INTO message_state (thread_id, message_id, finalized) VALUES (?1, ?2, 1)
                 ON CONFLICT(thread_id, message_id) DO UPDATE SET finalized = 1",
                rusqlite::params![thread_id, message_id],
            )
            .map_err(|e| PersistenceError::StoreUnavailable(e.to_string()))?;
        }

        if rows == 0 {
            Ok(AppendOutcome::Deduplicated)
        } else {
            Ok(AppendOutcome::Appended)
        }
    }

    async fn read_full_content(
        &self,
        thread_id: &str,
        message_id: &str,
    ) -> Result<(String, bool), PersistenceError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT kind, content FROM chunks
                 WHERE thread_id = ?1 AND message_id = ?2 AND kind IN ('text', 'thinking')
                 ORDER BY seq ASC",
            )
            .map_err(|e| PersistenceError::StoreUnavailable(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![thread_id, message_id], |row| {
                row.get::<_, String>(1)
            })
            .map_err(|e| PersistenceError::StoreUnavailable(e.to_string()))?;

        let mut full = String::new();
        for row in rows {
            let content_text = row.map_err(|e| PersistenceError::StoreUnavailable(e.to_string()))?;
            let value: serde_json::Value = serde_json::from_str(&content_text)
                .unwrap_or(serde_json::Value::Null);
            if let Some(delta) = value.get("delta").and_then(|v| v.as_str()) {
                full.push_str(delta);
            }
        }

        let finalized: bool = conn
            .query_row(
                "SELECT finalized FROM message_state WHERE thread_id = ?1 AND message_id = ?2",
                rusqlite::params![thread_id, message_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| PersistenceError::StoreUnavailable(e.to_string()))?
            .map(|v| v != 0)
            .unwrap_or(false);

        Ok((full, finalized))
    }
}

//! `SQLite` persistence for memories, idempotency markers, and the keyed cache.
//!
//! Every write that guards against duplicate work uses `INSERT OR IGNORE`
//! on a primary key and reports whether a row was actually created, so two
//! racing passes over the same post cannot both win.

use crate::error::{Result, XrError};
use crate::model::{Decision, IdempotencyRecord, MemoryKind, MemoryRecord};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::time::Duration;
use tracing::info;

const SCHEMA_VERSION: i32 = 1;

fn parse_rfc3339_or_now(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

/// `SQLite` storage manager
pub struct Storage {
    conn: Connection,
}

/// Row counts for `xreply status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageCounts {
    pub memories: i64,
    pub idempotency: i64,
    pub responded: i64,
    pub accounts: i64,
    pub cache_entries: i64,
}

impl Storage {
    /// Open or create the database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| XrError::path_error("create directory", parent, e))?;
            }
        }
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        let storage = Self { conn };
        storage.migrate()?;
        Ok(storage)
    }

    /// Open an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be initialized.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            ",
        )?;
        let storage = Self { conn };
        storage.migrate()?;
        Ok(storage)
    }

    fn migrate(&self) -> Result<()> {
        let current_version = self.get_schema_version();

        if current_version > SCHEMA_VERSION {
            return Err(XrError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: current_version,
            });
        }

        if current_version < SCHEMA_VERSION {
            info!(
                "Migrating database from version {} to {}",
                current_version, SCHEMA_VERSION
            );
            self.create_schema()?;
            self.set_schema_version(SCHEMA_VERSION)?;
        }

        Ok(())
    }

    fn get_schema_version(&self) -> i32 {
        let result: rusqlite::Result<i32> = self.conn.query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| {
                let value: String = row.get(0)?;
                Ok(value.parse().unwrap_or(0))
            },
        );

        // Treat missing schema table as version 0.
        result.unwrap_or_default()
    }

    fn set_schema_version(&self, version: i32) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?)",
            params![version.to_string()],
        )?;
        Ok(())
    }

    fn create_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                handle TEXT NOT NULL,
                name TEXT,
                source TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rooms (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS participants (
                user_id TEXT NOT NULL REFERENCES accounts(id),
                room_id TEXT NOT NULL REFERENCES rooms(id),
                PRIMARY KEY (user_id, room_id)
            );

            CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                user_id TEXT NOT NULL,
                room_id TEXT NOT NULL,
                text TEXT NOT NULL,
                url TEXT,
                in_reply_to TEXT,
                action TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memories_room ON memories(room_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_memories_external ON memories(external_id);

            CREATE TABLE IF NOT EXISTS idempotency (
                post_id TEXT PRIMARY KEY,
                response_id TEXT,
                decision TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cache (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                scope TEXT NOT NULL,
                value TEXT NOT NULL,
                expires_at TEXT,
                PRIMARY KEY (namespace, key, scope)
            );
            ",
        )?;

        Ok(())
    }

    // =========================================================================
    // Memories
    // =========================================================================

    /// Insert a memory unless one with the same id exists.
    ///
    /// Returns `true` when a row was created.
    ///
    /// # Errors
    ///
    /// Returns an error if the database insert fails.
    pub fn create_memory(&self, memory: &MemoryRecord) -> Result<bool> {
        let changed = self.conn.execute(
            r"
            INSERT OR IGNORE INTO memories
            (id, external_id, kind, user_id, room_id, text, url, in_reply_to, action, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
            params![
                memory.id,
                memory.external_id,
                memory.kind.as_str(),
                memory.user_id,
                memory.room_id,
                memory.text,
                memory.url,
                memory.in_reply_to,
                memory.action,
                memory.created_at.to_rfc3339(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Get a memory by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn get_memory(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let record = self
            .conn
            .query_row(
                r"SELECT id, external_id, kind, user_id, room_id, text, url, in_reply_to,
                         action, created_at
                  FROM memories WHERE id = ?",
                [id],
                |row| {
                    let kind: String = row.get(2)?;
                    let created_at: String = row.get(9)?;
                    Ok(MemoryRecord {
                        id: row.get(0)?,
                        external_id: row.get(1)?,
                        kind: MemoryKind::parse(&kind),
                        user_id: row.get(3)?,
                        room_id: row.get(4)?,
                        text: row.get(5)?,
                        url: row.get(6)?,
                        in_reply_to: row.get(7)?,
                        action: row.get(8)?,
                        created_at: parse_rfc3339_or_now(&created_at),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    // =========================================================================
    // Accounts / rooms
    // =========================================================================

    /// Make sure the account, the room, and their link all exist.
    ///
    /// # Errors
    ///
    /// Returns an error if any write fails.
    pub fn ensure_connection(
        &self,
        user_id: &str,
        room_id: &str,
        handle: &str,
        name: Option<&str>,
        source: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            r"
            INSERT INTO accounts (id, handle, name, source, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                handle = excluded.handle,
                name = COALESCE(excluded.name, accounts.name),
                updated_at = excluded.updated_at
            ",
            params![user_id, handle, name, source, now],
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO rooms (id, created_at) VALUES (?, ?)",
            params![room_id, now],
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO participants (user_id, room_id) VALUES (?, ?)",
            params![user_id, room_id],
        )?;
        Ok(())
    }

    /// Whether `user_id` participates in `room_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn is_participant(&self, user_id: &str, room_id: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM participants WHERE user_id = ? AND room_id = ?",
                params![user_id, room_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // =========================================================================
    // Idempotency
    // =========================================================================

    /// Record that a post has been handled. Returns `false` if a record
    /// already existed; the existing record is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the database insert fails.
    pub fn record_idempotency(&self, record: &IdempotencyRecord) -> Result<bool> {
        let changed = self.conn.execute(
            r"
            INSERT OR IGNORE INTO idempotency (post_id, response_id, decision, created_at)
            VALUES (?, ?, ?, ?)
            ",
            params![
                record.post_id,
                record.response_id,
                record.decision.as_str(),
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Get the idempotency record for a post.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn get_idempotency(&self, post_id: &str) -> Result<Option<IdempotencyRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT post_id, response_id, decision, created_at FROM idempotency WHERE post_id = ?",
                [post_id],
                |row| {
                    let decision: String = row.get(2)?;
                    let created_at: String = row.get(3)?;
                    Ok(IdempotencyRecord {
                        post_id: row.get(0)?,
                        response_id: row.get(1)?,
                        decision: decision.parse().unwrap_or(Decision::Ignore),
                        created_at: parse_rfc3339_or_now(&created_at),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    // =========================================================================
    // Keyed cache
    // =========================================================================

    /// Read a cache value that has not expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn cache_get(&self, namespace: &str, key: &str, scope: &str) -> Result<Option<String>> {
        let row: Option<(String, Option<String>)> = self
            .conn
            .query_row(
                "SELECT value, expires_at FROM cache WHERE namespace = ? AND key = ? AND scope = ?",
                params![namespace, key, scope],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(row.and_then(|(value, expires_at)| match expires_at {
            Some(at) if parse_rfc3339_or_now(&at) <= Utc::now() => None,
            _ => Some(value),
        }))
    }

    /// Write a cache value; `ttl = None` never expires.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub fn cache_set(
        &self,
        namespace: &str,
        key: &str,
        scope: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| (Utc::now() + ttl).to_rfc3339());
        self.conn.execute(
            r"
            INSERT OR REPLACE INTO cache (namespace, key, scope, value, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ",
            params![namespace, key, scope, value, expires_at],
        )?;
        Ok(())
    }

    /// Delete a cache value. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub fn cache_delete(&self, namespace: &str, key: &str, scope: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM cache WHERE namespace = ? AND key = ? AND scope = ?",
            params![namespace, key, scope],
        )?;
        Ok(changed > 0)
    }

    // =========================================================================
    // Stats
    // =========================================================================

    /// Row counts across tables.
    ///
    /// # Errors
    ///
    /// Returns an error if any count query fails.
    pub fn counts(&self) -> Result<StorageCounts> {
        let count = |sql: &str| -> Result<i64> { Ok(self.conn.query_row(sql, [], |row| row.get(0))?) };
        Ok(StorageCounts {
            memories: count("SELECT COUNT(*) FROM memories")?,
            idempotency: count("SELECT COUNT(*) FROM idempotency")?,
            responded: count("SELECT COUNT(*) FROM idempotency WHERE response_id IS NOT NULL")?,
            accounts: count("SELECT COUNT(*) FROM accounts")?,
            cache_entries: count("SELECT COUNT(*) FROM cache")?,
        })
    }
}

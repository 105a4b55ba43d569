pub mod attachments;
pub mod branches;
pub mod conversations;
pub mod messages;
pub mod models;
pub mod personas;
pub mod sessions;
pub mod settings;
pub mod shares;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub const MAIN_BRANCH: &str = "main";

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Invalid(String),
    #[error("{0} has expired")]
    Expired(&'static str),
    #[error("database connection lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, DbError>;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        tracing::info!(path = %db_path.display(), "database ready");
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Locks the connection. Callers must drop the guard before any `.await`.
    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_sessions (
                token_hash TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS personas (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                system_prompt TEXT NOT NULL,
                temperature REAL,
                max_tokens INTEGER,
                is_default INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS persona_memories (
                id TEXT PRIMARY KEY,
                persona_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (persona_id) REFERENCES personas(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                model TEXT NOT NULL,
                system_prompt TEXT,
                persona_id TEXT,
                is_shared INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (persona_id) REFERENCES personas(id) ON DELETE SET NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_owner
                ON conversations(user_id, updated_at DESC);

            CREATE TABLE IF NOT EXISTS conversation_branches (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                branch_name TEXT NOT NULL,
                display_name TEXT NOT NULL,
                source_message_id TEXT,
                is_active INTEGER NOT NULL DEFAULT 0,
                message_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE (conversation_id, branch_name),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
                content TEXT NOT NULL,
                attachments TEXT NOT NULL DEFAULT '[]',
                branch_name TEXT NOT NULL,
                parent_message_id TEXT,
                model TEXT,
                prompt_tokens INTEGER,
                completion_tokens INTEGER,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_messages_branch
                ON messages(conversation_id, branch_name, created_at);

            CREATE TABLE IF NOT EXISTS shared_conversations (
                id TEXT PRIMARY KEY,
                token TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL,
                branch_name TEXT NOT NULL,
                user_id TEXT NOT NULL,
                expires_at TEXT,
                view_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE (conversation_id, branch_name),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS attachments (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                storage_path TEXT NOT NULL,
                file_name TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                extracted_text TEXT,
                message_id TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE SET NULL
            );

            CREATE TABLE IF NOT EXISTS user_api_keys (
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                encrypted_key TEXT NOT NULL,
                iv TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, provider)
            );

            CREATE TABLE IF NOT EXISTS user_settings (
                user_id TEXT PRIMARY KEY,
                default_model TEXT,
                default_persona_id TEXT,
                theme TEXT,
                preferences TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }
}

// ── Timestamps ──
//
// Stored as fixed-width RFC 3339 with microseconds so that string order in
// SQLite matches chronological order.

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Next timestamp for a message appended to `branch_name`, strictly after
/// the branch's latest message even when the clock has not advanced.
pub(crate) fn next_message_timestamp(
    conn: &Connection,
    conversation_id: &str,
    branch_name: &str,
) -> Result<String> {
    let last: Option<String> = conn
        .query_row(
            "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1 AND branch_name = ?2",
            params![conversation_id, branch_name],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    let now = Utc::now();
    let next = match last.as_deref().and_then(parse_timestamp) {
        Some(last) if now <= last => last + Duration::microseconds(1),
        _ => now,
    };
    Ok(format_timestamp(next))
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Random alphanumeric token for share links and sessions.
pub fn random_token(len: usize) -> String {
    use rand::distr::Alphanumeric;
    use rand::Rng;

    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = format_timestamp(Utc::now());
        let later = format_timestamp(Utc::now() + Duration::milliseconds(5));
        assert!(earlier < later);
        assert_eq!(earlier.len(), later.len());
    }

    #[test]
    fn test_parse_timestamp_roundtrip() {
        let ts = now_timestamp();
        let parsed = parse_timestamp(&ts).unwrap();
        assert_eq!(format_timestamp(parsed), ts);
    }

    #[test]
    fn test_random_token_shape() {
        let a = random_token(32);
        let b = random_token(32);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let conn = db.conn().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'conversation_branches'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}

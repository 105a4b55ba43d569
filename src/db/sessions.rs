use super::models::User;
use super::{now_timestamp, random_token, Database, Result};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};

const SESSION_TOKEN_LEN: usize = 48;

/// Only the SHA-256 of a session token is persisted.
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

impl Database {
    // ── Users & sessions ──

    pub fn ensure_user(&self, id: &str, email: Option<&str>) -> Result<User> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (id, email, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (id) DO UPDATE SET email = COALESCE(excluded.email, users.email)",
            params![id, email, now_timestamp()],
        )?;
        Ok(conn.query_row(
            "SELECT id, email, created_at FROM users WHERE id = ?1",
            params![id],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    created_at: row.get(2)?,
                })
            },
        )?)
    }

    /// Issues a new session for an existing user and returns the raw token.
    pub fn create_session(&self, user_id: &str) -> Result<String> {
        let token = random_token(SESSION_TOKEN_LEN);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO user_sessions (token_hash, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![hash_token(&token), user_id, now_timestamp()],
        )?;
        Ok(token)
    }

    pub fn resolve_session(&self, token: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT user_id FROM user_sessions WHERE token_hash = ?1",
                params![hash_token(token)],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn revoke_session(&self, token: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM user_sessions WHERE token_hash = ?1",
            params![hash_token(token)],
        )?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        db.ensure_user("u1", Some("u1@example.com")).unwrap();
        let token = db.create_session("u1").unwrap();

        assert_eq!(db.resolve_session(&token).unwrap().as_deref(), Some("u1"));
        assert_eq!(db.resolve_session("forged").unwrap(), None);

        assert!(db.revoke_session(&token).unwrap());
        assert_eq!(db.resolve_session(&token).unwrap(), None);
    }

    #[test]
    fn test_session_requires_user() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.create_session("ghost").is_err());
    }

    #[test]
    fn test_ensure_user_keeps_email() {
        let db = Database::open_in_memory().unwrap();
        db.ensure_user("u1", Some("a@example.com")).unwrap();
        let user = db.ensure_user("u1", None).unwrap();
        assert_eq!(user.email.as_deref(), Some("a@example.com"));
    }

    #[test]
    fn test_tokens_stored_hashed() {
        let db = Database::open_in_memory().unwrap();
        db.ensure_user("u1", None).unwrap();
        let token = db.create_session("u1").unwrap();
        let conn = db.conn().unwrap();
        let stored: String = conn
            .query_row("SELECT token_hash FROM user_sessions", [], |row| row.get(0))
            .unwrap();
        assert_ne!(stored, token);
        assert_eq!(stored, hash_token(&token));
        assert_eq!(stored.len(), 64);
    }
}

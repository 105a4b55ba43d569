use super::branches::branch_exists;
use super::conversations::get_owned;
use super::messages::branch_messages;
use super::models::{Message, SharedConversation};
use super::{new_id, now_timestamp, parse_timestamp, random_token, Database, DbError, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

const SHARE_TOKEN_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct NewShare {
    pub conversation_id: String,
    pub branch_name: String,
    pub expires_at: Option<String>,
}

/// Read-only view of one shared branch, safe to hand to anonymous readers.
#[derive(Debug, Clone, Serialize)]
pub struct SharedTranscript {
    pub title: String,
    pub model: String,
    pub branch_name: String,
    pub messages: Vec<Message>,
    pub view_count: i64,
    pub expires_at: Option<String>,
    pub shared_at: String,
}

fn find_by_pair(
    conn: &Connection,
    conversation_id: &str,
    branch_name: &str,
) -> Result<Option<SharedConversation>> {
    let sql = format!(
        "SELECT {} FROM shared_conversations WHERE conversation_id = ?1 AND branch_name = ?2",
        SharedConversation::COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![conversation_id, branch_name], SharedConversation::from_row)
        .optional()?)
}

/// Keeps `conversations.is_shared` in step with the share rows.
pub(crate) fn refresh_shared_flag(conn: &Connection, conversation_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET is_shared =
            EXISTS (SELECT 1 FROM shared_conversations WHERE conversation_id = ?1)
         WHERE id = ?1",
        params![conversation_id],
    )?;
    Ok(())
}

pub fn is_expired(share: &SharedConversation) -> bool {
    share
        .expires_at
        .as_deref()
        .and_then(parse_timestamp)
        .is_some_and(|expires| expires <= Utc::now())
}

impl Database {
    // ── Sharing ──

    /// Shares one branch. Sharing an already shared branch returns the existing
    /// token, with the expiry replaced when a new one is given.
    pub fn create_share(&self, user_id: &str, new: NewShare) -> Result<SharedConversation> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        get_owned(&tx, user_id, &new.conversation_id)?;
        if !branch_exists(&tx, &new.conversation_id, &new.branch_name)? {
            return Err(DbError::NotFound("branch"));
        }

        if let Some(existing) = find_by_pair(&tx, &new.conversation_id, &new.branch_name)? {
            if new.expires_at.is_some() {
                tx.execute(
                    "UPDATE shared_conversations SET expires_at = ?1 WHERE id = ?2",
                    params![new.expires_at, existing.id],
                )?;
            }
        } else {
            tx.execute(
                "INSERT INTO shared_conversations (id, token, conversation_id, branch_name, user_id, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new_id(),
                    random_token(SHARE_TOKEN_LEN),
                    new.conversation_id,
                    new.branch_name,
                    user_id,
                    new.expires_at,
                    now_timestamp()
                ],
            )?;
        }
        refresh_shared_flag(&tx, &new.conversation_id)?;
        let share = find_by_pair(&tx, &new.conversation_id, &new.branch_name)?
            .ok_or(DbError::NotFound("share"))?;
        tx.commit()?;
        Ok(share)
    }

    pub fn list_shares(&self, user_id: &str, conversation_id: &str) -> Result<Vec<SharedConversation>> {
        let conn = self.conn()?;
        get_owned(&conn, user_id, conversation_id)?;
        let sql = format!(
            "SELECT {} FROM shared_conversations WHERE conversation_id = ?1 ORDER BY created_at ASC",
            SharedConversation::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![conversation_id], SharedConversation::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete_share(&self, user_id: &str, conversation_id: &str, share_id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        get_owned(&tx, user_id, conversation_id)?;
        let deleted = tx.execute(
            "DELETE FROM shared_conversations WHERE id = ?1 AND conversation_id = ?2",
            params![share_id, conversation_id],
        )?;
        if deleted == 0 {
            return Err(DbError::NotFound("share"));
        }
        refresh_shared_flag(&tx, conversation_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Resolves a share token to the transcript of exactly the shared branch.
    pub fn resolve_share(&self, token: &str) -> Result<SharedTranscript> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM shared_conversations WHERE token = ?1",
            SharedConversation::COLUMNS
        );
        let share = conn
            .query_row(&sql, params![token], SharedConversation::from_row)
            .optional()?
            .ok_or(DbError::NotFound("share"))?;
        if is_expired(&share) {
            return Err(DbError::Expired("share"));
        }

        let conversation = get_owned(&conn, &share.user_id, &share.conversation_id)?;
        let messages = branch_messages(&conn, &share.conversation_id, &share.branch_name)?;
        Ok(SharedTranscript {
            title: conversation.title,
            model: conversation.model,
            branch_name: share.branch_name,
            messages,
            view_count: share.view_count,
            expires_at: share.expires_at,
            shared_at: share.created_at,
        })
    }

    pub fn increment_share_views(&self, token: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE shared_conversations SET view_count = view_count + 1 WHERE token = ?1",
            params![token],
        )?;
        Ok(())
    }
}

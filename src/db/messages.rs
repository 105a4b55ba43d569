use super::branches::{active_branch_name, branch_exists};
use super::conversations::{get_owned, touch};
use super::models::{AttachmentRef, Message, Role};
use super::{new_id, next_message_timestamp, Database, DbError, Result};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub branch_name: String,
    pub role: Role,
    pub content: String,
    pub attachments: Vec<AttachmentRef>,
    /// Defaults to the branch's latest message.
    pub parent_message_id: Option<String>,
    pub model: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
}

impl NewMessage {
    pub fn new(conversation_id: &str, branch_name: &str, role: Role, content: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            branch_name: branch_name.to_string(),
            role,
            content: content.to_string(),
            attachments: Vec::new(),
            parent_message_id: None,
            model: None,
            prompt_tokens: None,
            completion_tokens: None,
        }
    }
}

/// Messages of one branch, oldest first.
pub(crate) fn branch_messages(
    conn: &Connection,
    conversation_id: &str,
    branch_name: &str,
) -> Result<Vec<Message>> {
    let sql = format!(
        "SELECT {} FROM messages WHERE conversation_id = ?1 AND branch_name = ?2
         ORDER BY created_at ASC, rowid ASC",
        Message::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![conversation_id, branch_name], Message::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub(crate) fn find_message(
    conn: &Connection,
    conversation_id: &str,
    message_id: &str,
) -> Result<Option<Message>> {
    let sql = format!(
        "SELECT {} FROM messages WHERE id = ?1 AND conversation_id = ?2",
        Message::COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![message_id, conversation_id], Message::from_row)
        .optional()?)
}

fn latest_message_id(
    conn: &Connection,
    conversation_id: &str,
    branch_name: &str,
) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM messages WHERE conversation_id = ?1 AND branch_name = ?2
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            params![conversation_id, branch_name],
            |row| row.get(0),
        )
        .optional()?)
}

impl Database {
    // ── Messages ──

    /// Appends a message to a branch, links its attachments and touches the
    /// conversation.
    pub fn add_message(&self, user_id: &str, new: NewMessage) -> Result<Message> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        get_owned(&tx, user_id, &new.conversation_id)?;
        if !branch_exists(&tx, &new.conversation_id, &new.branch_name)? {
            return Err(DbError::NotFound("branch"));
        }

        let parent = match new.parent_message_id {
            Some(parent) => Some(parent),
            None => latest_message_id(&tx, &new.conversation_id, &new.branch_name)?,
        };
        let id = new_id();
        let created_at = next_message_timestamp(&tx, &new.conversation_id, &new.branch_name)?;
        let attachments = serde_json::to_string(&new.attachments)
            .map_err(|e| DbError::Invalid(e.to_string()))?;

        tx.execute(
            "INSERT INTO messages (id, conversation_id, role, content, attachments, branch_name,
                                   parent_message_id, model, prompt_tokens, completion_tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                new.conversation_id,
                new.role,
                new.content,
                attachments,
                new.branch_name,
                parent,
                new.model,
                new.prompt_tokens,
                new.completion_tokens,
                created_at
            ],
        )?;
        tx.execute(
            "UPDATE conversation_branches SET message_count = message_count + 1
             WHERE conversation_id = ?1 AND branch_name = ?2",
            params![new.conversation_id, new.branch_name],
        )?;
        for attachment in &new.attachments {
            tx.execute(
                "UPDATE attachments SET message_id = ?1 WHERE id = ?2 AND user_id = ?3",
                params![id, attachment.id, user_id],
            )?;
        }
        touch(&tx, &new.conversation_id)?;

        let message = find_message(&tx, &new.conversation_id, &id)?
            .ok_or(DbError::NotFound("message"))?;
        tx.commit()?;
        Ok(message)
    }

    /// Lists a branch's messages; `None` selects the active branch.
    pub fn list_messages(
        &self,
        user_id: &str,
        conversation_id: &str,
        branch_name: Option<&str>,
    ) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        get_owned(&conn, user_id, conversation_id)?;
        let branch = match branch_name {
            Some(name) => {
                if !branch_exists(&conn, conversation_id, name)? {
                    return Err(DbError::NotFound("branch"));
                }
                name.to_string()
            }
            None => active_branch_name(&conn, conversation_id)?,
        };
        branch_messages(&conn, conversation_id, &branch)
    }

    pub fn get_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Message> {
        let conn = self.conn()?;
        get_owned(&conn, user_id, conversation_id)?;
        find_message(&conn, conversation_id, message_id)?.ok_or(DbError::NotFound("message"))
    }

    /// Backfills token usage once the provider reports it. The only update a
    /// stored message ever receives.
    pub fn record_usage(
        &self,
        message_id: &str,
        prompt_tokens: Option<i64>,
        completion_tokens: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE messages SET
                prompt_tokens = COALESCE(?1, prompt_tokens),
                completion_tokens = COALESCE(?2, completion_tokens)
             WHERE id = ?3",
            params![prompt_tokens, completion_tokens, message_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::conversations::NewConversation;
    use crate::db::MAIN_BRANCH;

    fn setup() -> (Database, String) {
        let db = Database::open_in_memory().unwrap();
        let conv = db
            .create_conversation(
                "u1",
                NewConversation {
                    title: "t".into(),
                    model: "openai/gpt-4o".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        (db, conv.id)
    }

    #[test]
    fn test_messages_chain_parents_and_order() {
        let (db, conv) = setup();
        let first = db
            .add_message("u1", NewMessage::new(&conv, MAIN_BRANCH, Role::User, "one"))
            .unwrap();
        let second = db
            .add_message("u1", NewMessage::new(&conv, MAIN_BRANCH, Role::Assistant, "two"))
            .unwrap();

        assert_eq!(first.parent_message_id, None);
        assert_eq!(second.parent_message_id.as_deref(), Some(first.id.as_str()));
        assert!(first.created_at < second.created_at);

        let listed = db.list_messages("u1", &conv, None).unwrap();
        let contents: Vec<_> = listed.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two"]);

        let branches = db.list_branches("u1", &conv).unwrap();
        assert_eq!(branches[0].message_count, 2);
    }

    #[test]
    fn test_add_message_to_missing_branch_fails() {
        let (db, conv) = setup();
        let err = db
            .add_message("u1", NewMessage::new(&conv, "nope", Role::User, "x"))
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound("branch")));
    }

    #[test]
    fn test_add_message_requires_ownership() {
        let (db, conv) = setup();
        let err = db
            .add_message("u2", NewMessage::new(&conv, MAIN_BRANCH, Role::User, "x"))
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound("conversation")));
    }

    #[test]
    fn test_record_usage_backfills_only_given_fields() {
        let (db, conv) = setup();
        let mut new = NewMessage::new(&conv, MAIN_BRANCH, Role::Assistant, "answer");
        new.completion_tokens = Some(12);
        let msg = db.add_message("u1", new).unwrap();

        db.record_usage(&msg.id, Some(40), None).unwrap();

        let stored = db.get_message("u1", &conv, &msg.id).unwrap();
        assert_eq!(stored.prompt_tokens, Some(40));
        assert_eq!(stored.completion_tokens, Some(12));
        assert_eq!(stored.content, "answer");
    }
}

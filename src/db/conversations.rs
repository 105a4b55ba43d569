use super::models::Conversation;
use super::{new_id, now_timestamp, Database, DbError, Result, MAIN_BRANCH};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone, Default)]
pub struct NewConversation {
    /// Client-chosen id; creating an id the caller already owns returns the existing row.
    pub id: Option<String>,
    pub title: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub persona_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub persona_id: Option<String>,
}

pub(crate) fn find_owned(
    conn: &Connection,
    user_id: &str,
    id: &str,
) -> Result<Option<Conversation>> {
    let sql = format!(
        "SELECT {} FROM conversations WHERE id = ?1 AND user_id = ?2",
        Conversation::COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![id, user_id], Conversation::from_row)
        .optional()?)
}

pub(crate) fn get_owned(conn: &Connection, user_id: &str, id: &str) -> Result<Conversation> {
    find_owned(conn, user_id, id)?.ok_or(DbError::NotFound("conversation"))
}

pub(crate) fn touch(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
        params![now_timestamp(), id],
    )?;
    Ok(())
}

impl Database {
    // ── Conversations ──

    /// Creates a conversation together with its active `main` branch.
    pub fn create_conversation(&self, user_id: &str, new: NewConversation) -> Result<Conversation> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if let Some(id) = new.id.as_deref() {
            if let Some(existing) = find_owned(&tx, user_id, id)? {
                return Ok(existing);
            }
            let taken: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM conversations WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            if taken.is_some() {
                return Err(DbError::Conflict("conversation id already in use".into()));
            }
        }

        let id = new.id.unwrap_or_else(new_id);
        let now = now_timestamp();
        tx.execute(
            "INSERT INTO conversations (id, user_id, title, model, system_prompt, persona_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![id, user_id, new.title, new.model, new.system_prompt, new.persona_id, now],
        )?;
        tx.execute(
            "INSERT INTO conversation_branches (id, conversation_id, branch_name, display_name, is_active, message_count, created_at)
             VALUES (?1, ?2, ?3, 'Main', 1, 0, ?4)",
            params![new_id(), id, MAIN_BRANCH, now],
        )?;
        let conversation = get_owned(&tx, user_id, &id)?;
        tx.commit()?;

        tracing::debug!(conversation_id = %conversation.id, "conversation created");
        Ok(conversation)
    }

    pub fn get_conversation(&self, user_id: &str, id: &str) -> Result<Conversation> {
        let conn = self.conn()?;
        get_owned(&conn, user_id, id)
    }

    pub fn find_conversation(&self, user_id: &str, id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn()?;
        find_owned(&conn, user_id, id)
    }

    /// Most recently updated first.
    pub fn list_conversations(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Conversation>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM conversations WHERE user_id = ?1
             ORDER BY updated_at DESC, id ASC LIMIT ?2 OFFSET ?3",
            Conversation::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, limit, offset], Conversation::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn update_conversation(
        &self,
        user_id: &str,
        id: &str,
        update: ConversationUpdate,
    ) -> Result<Conversation> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE conversations SET
                title = COALESCE(?1, title),
                model = COALESCE(?2, model),
                system_prompt = COALESCE(?3, system_prompt),
                persona_id = COALESCE(?4, persona_id),
                updated_at = ?5
             WHERE id = ?6 AND user_id = ?7",
            params![
                update.title,
                update.model,
                update.system_prompt,
                update.persona_id,
                now_timestamp(),
                id,
                user_id
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound("conversation"));
        }
        get_owned(&conn, user_id, id)
    }

    /// Branches, messages and share rows go with the conversation; attachments
    /// survive but lose their message link.
    pub fn delete_conversation(&self, user_id: &str, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM conversations WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        if deleted == 0 {
            return Err(DbError::NotFound("conversation"));
        }
        tracing::debug!(conversation_id = %id, "conversation deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::messages::NewMessage;
    use crate::db::models::Role;
    use crate::db::shares::NewShare;

    fn new_conversation(title: &str) -> NewConversation {
        NewConversation {
            title: title.into(),
            model: "openai/gpt-4o".into(),
            ..Default::default()
        }
    }

    fn count(db: &Database, sql: &str, id: &str) -> i64 {
        let conn = db.conn().unwrap();
        conn.query_row(sql, params![id], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_create_conversation_creates_main_branch() {
        let db = Database::open_in_memory().unwrap();
        let conv = db.create_conversation("u1", new_conversation("Hello")).unwrap();

        let branches = db.list_branches("u1", &conv.id).unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].branch_name, MAIN_BRANCH);
        assert!(branches[0].is_active);
    }

    #[test]
    fn test_create_conversation_is_idempotent_on_id() {
        let db = Database::open_in_memory().unwrap();
        let mut new = new_conversation("First");
        new.id = Some("c-fixed".into());
        let first = db.create_conversation("u1", new.clone()).unwrap();
        new.title = "Second".into();
        let second = db.create_conversation("u1", new).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.title, "First");
        assert_eq!(
            count(&db, "SELECT COUNT(*) FROM conversation_branches WHERE conversation_id = ?1", "c-fixed"),
            1
        );
    }

    #[test]
    fn test_create_conversation_rejects_foreign_id() {
        let db = Database::open_in_memory().unwrap();
        let mut new = new_conversation("Mine");
        new.id = Some("c-fixed".into());
        db.create_conversation("u1", new.clone()).unwrap();

        let err = db.create_conversation("u2", new).unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }

    #[test]
    fn test_list_conversations_scoped_and_ordered_by_recency() {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_conversation("u1", new_conversation("A")).unwrap();
        let b = db.create_conversation("u1", new_conversation("B")).unwrap();
        db.create_conversation("u2", new_conversation("Other")).unwrap();

        db.add_message(
            "u1",
            NewMessage::new(&a.id, MAIN_BRANCH, Role::User, "bump"),
        )
        .unwrap();

        let list = db.list_conversations("u1", 50, 0).unwrap();
        let ids: Vec<_> = list.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str()]);
    }

    #[test]
    fn test_get_conversation_of_other_user_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let conv = db.create_conversation("u1", new_conversation("A")).unwrap();
        let err = db.get_conversation("u2", &conv.id).unwrap_err();
        assert!(matches!(err, DbError::NotFound("conversation")));
    }

    #[test]
    fn test_update_conversation_keeps_unset_fields() {
        let db = Database::open_in_memory().unwrap();
        let conv = db.create_conversation("u1", new_conversation("A")).unwrap();
        let updated = db
            .update_conversation(
                "u1",
                &conv.id,
                ConversationUpdate {
                    title: Some("Renamed".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.title, "Renamed");
        assert_eq!(updated.model, "openai/gpt-4o");
    }

    #[test]
    fn test_delete_conversation_cascades() {
        let db = Database::open_in_memory().unwrap();
        let conv = db.create_conversation("u1", new_conversation("A")).unwrap();
        let msg = db
            .add_message("u1", NewMessage::new(&conv.id, MAIN_BRANCH, Role::User, "hi"))
            .unwrap();
        db.create_branch_from_message("u1", &conv.id, &msg.id, None, Some("Alt".into()), true)
            .unwrap();
        db.create_share(
            "u1",
            NewShare {
                conversation_id: conv.id.clone(),
                branch_name: MAIN_BRANCH.into(),
                expires_at: None,
            },
        )
        .unwrap();

        db.delete_conversation("u1", &conv.id).unwrap();

        for sql in [
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            "SELECT COUNT(*) FROM conversation_branches WHERE conversation_id = ?1",
            "SELECT COUNT(*) FROM shared_conversations WHERE conversation_id = ?1",
        ] {
            assert_eq!(count(&db, sql, &conv.id), 0, "{}", sql);
        }
    }

    #[test]
    fn test_delete_conversation_of_other_user_fails() {
        let db = Database::open_in_memory().unwrap();
        let conv = db.create_conversation("u1", new_conversation("A")).unwrap();
        assert!(db.delete_conversation("u2", &conv.id).is_err());
        assert!(db.get_conversation("u1", &conv.id).is_ok());
    }
}

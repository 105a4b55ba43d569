use super::models::Attachment;
use super::{now_timestamp, Database, DbError, Result};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub id: String,
    pub storage_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub extracted_text: Option<String>,
}

fn find_owned(conn: &Connection, user_id: &str, id: &str) -> Result<Option<Attachment>> {
    let sql = format!(
        "SELECT {} FROM attachments WHERE id = ?1 AND user_id = ?2",
        Attachment::COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![id, user_id], Attachment::from_row)
        .optional()?)
}

impl Database {
    // ── Attachments ──

    pub fn insert_attachment(&self, user_id: &str, new: NewAttachment) -> Result<Attachment> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO attachments (id, user_id, storage_path, file_name, mime_type, size_bytes, extracted_text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.id,
                user_id,
                new.storage_path,
                new.file_name,
                new.mime_type,
                new.size_bytes,
                new.extracted_text,
                now_timestamp()
            ],
        )?;
        find_owned(&conn, user_id, &new.id)?.ok_or(DbError::NotFound("attachment"))
    }

    pub fn get_attachment(&self, user_id: &str, id: &str) -> Result<Attachment> {
        let conn = self.conn()?;
        find_owned(&conn, user_id, id)?.ok_or(DbError::NotFound("attachment"))
    }

    /// Loads several attachments in the given order; any missing id fails the lookup.
    pub fn get_attachments(&self, user_id: &str, ids: &[String]) -> Result<Vec<Attachment>> {
        let conn = self.conn()?;
        ids.iter()
            .map(|id| find_owned(&conn, user_id, id)?.ok_or(DbError::NotFound("attachment")))
            .collect()
    }

    /// Deletes the row and returns it so the caller can remove the stored object.
    pub fn delete_attachment(&self, user_id: &str, id: &str) -> Result<Attachment> {
        let conn = self.conn()?;
        let attachment = find_owned(&conn, user_id, id)?.ok_or(DbError::NotFound("attachment"))?;
        conn.execute(
            "DELETE FROM attachments WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        Ok(attachment)
    }

    pub fn count_attachments(&self, user_id: &str) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM attachments WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::conversations::NewConversation;
    use crate::db::messages::NewMessage;
    use crate::db::models::Role;
    use crate::db::MAIN_BRANCH;

    fn new_attachment(id: &str) -> NewAttachment {
        NewAttachment {
            id: id.into(),
            storage_path: format!("u1/{}-notes.txt", id),
            file_name: "notes.txt".into(),
            mime_type: "text/plain".into(),
            size_bytes: 5,
            extracted_text: Some("hello".into()),
        }
    }

    #[test]
    fn test_attachments_are_owner_scoped() {
        let db = Database::open_in_memory().unwrap();
        db.insert_attachment("u1", new_attachment("a1")).unwrap();

        assert!(db.get_attachment("u1", "a1").is_ok());
        assert!(matches!(
            db.get_attachment("u2", "a1").unwrap_err(),
            DbError::NotFound("attachment")
        ));
        assert!(db.delete_attachment("u2", "a1").is_err());
        assert_eq!(db.count_attachments("u1").unwrap(), 1);
    }

    #[test]
    fn test_get_attachments_fails_on_missing_id() {
        let db = Database::open_in_memory().unwrap();
        db.insert_attachment("u1", new_attachment("a1")).unwrap();
        let ids = vec!["a1".to_string(), "a2".to_string()];
        assert!(db.get_attachments("u1", &ids).is_err());
    }

    #[test]
    fn test_message_link_set_and_cleared_with_conversation() {
        let db = Database::open_in_memory().unwrap();
        let attachment = db.insert_attachment("u1", new_attachment("a1")).unwrap();
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
        let mut new = NewMessage::new(&conv.id, MAIN_BRANCH, Role::User, "see file");
        new.attachments = vec![attachment.to_ref()];
        let msg = db.add_message("u1", new).unwrap();

        assert_eq!(
            db.get_attachment("u1", "a1").unwrap().message_id.as_deref(),
            Some(msg.id.as_str())
        );

        db.delete_conversation("u1", &conv.id).unwrap();
        let unlinked = db.get_attachment("u1", "a1").unwrap();
        assert_eq!(unlinked.message_id, None);
    }
}

use super::conversations::{get_owned, touch};
use super::messages::{branch_messages, find_message};
use super::models::{Branch, Message};
use super::shares::refresh_shared_flag;
use super::{new_id, now_timestamp, Database, DbError, Result, MAIN_BRANCH};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;

const MAX_BRANCH_NAME_LEN: usize = 64;

/// Where the messages of a new branch come from.
#[derive(Debug, Clone)]
pub enum BranchSource {
    /// Fork at a message: its branch's history up to and including it.
    Message(String),
    /// Clone the active branch, optionally only through the zero-based index.
    Active { up_to_index: Option<usize> },
}

#[derive(Debug, Clone)]
pub struct NewBranch {
    pub branch_name: Option<String>,
    pub display_name: Option<String>,
    pub source: BranchSource,
    pub activate: bool,
}

pub fn validate_branch_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() || name.len() > MAX_BRANCH_NAME_LEN {
        return Err(format!(
            "branch name must be 1 to {} characters",
            MAX_BRANCH_NAME_LEN
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err("branch name may only contain a-z, 0-9 and '-'".into());
    }
    Ok(())
}

/// Turns a display name into a branch slug, e.g. "Try #2: Shorter" -> "try-2-shorter".
pub fn slugify(display_name: &str) -> String {
    let mut slug = String::new();
    for c in display_name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let mut slug: String = slug
        .trim_end_matches('-')
        .chars()
        .take(MAX_BRANCH_NAME_LEN - 4)
        .collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        "branch".to_string()
    } else {
        slug
    }
}

pub(crate) fn branch_exists(conn: &Connection, conversation_id: &str, name: &str) -> Result<bool> {
    Ok(find_branch(conn, conversation_id, name)?.is_some())
}

fn find_branch(conn: &Connection, conversation_id: &str, name: &str) -> Result<Option<Branch>> {
    let sql = format!(
        "SELECT {} FROM conversation_branches WHERE conversation_id = ?1 AND branch_name = ?2",
        Branch::COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![conversation_id, name], Branch::from_row)
        .optional()?)
}

fn get_branch(conn: &Connection, conversation_id: &str, name: &str) -> Result<Branch> {
    find_branch(conn, conversation_id, name)?.ok_or(DbError::NotFound("branch"))
}

/// The active branch, or `main` when no row is flagged.
pub(crate) fn active_branch_name(conn: &Connection, conversation_id: &str) -> Result<String> {
    let active: Option<String> = conn
        .query_row(
            "SELECT branch_name FROM conversation_branches
             WHERE conversation_id = ?1 AND is_active = 1 LIMIT 1",
            params![conversation_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(active.unwrap_or_else(|| MAIN_BRANCH.to_string()))
}

fn set_active(conn: &Connection, conversation_id: &str, name: &str) -> Result<()> {
    conn.execute(
        "UPDATE conversation_branches SET is_active = (branch_name = ?2) WHERE conversation_id = ?1",
        params![conversation_id, name],
    )?;
    Ok(())
}

fn unique_slug(conn: &Connection, conversation_id: &str, base: &str) -> Result<String> {
    let mut candidate = base.to_string();
    let mut n = 2;
    while candidate == MAIN_BRANCH || branch_exists(conn, conversation_id, &candidate)? {
        candidate = format!("{}-{}", base, n);
        n += 1;
    }
    Ok(candidate)
}

/// Copies messages into `branch_name`, keeping timestamps, usage and
/// attachment references. Parent links are remapped onto the copies.
fn copy_messages(
    conn: &Connection,
    messages: &[Message],
    branch_name: &str,
) -> Result<Option<String>> {
    let mut id_map: HashMap<&str, String> = HashMap::new();
    let mut last_id = None;

    for message in messages {
        let id = new_id();
        let parent = message
            .parent_message_id
            .as_deref()
            .and_then(|p| id_map.get(p).cloned());
        let attachments = serde_json::to_string(&message.attachments)
            .map_err(|e| DbError::Invalid(e.to_string()))?;
        conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, attachments, branch_name,
                                   parent_message_id, model, prompt_tokens, completion_tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                message.conversation_id,
                message.role,
                message.content,
                attachments,
                branch_name,
                parent,
                message.model,
                message.prompt_tokens,
                message.completion_tokens,
                message.created_at
            ],
        )?;
        id_map.insert(message.id.as_str(), id.clone());
        last_id = Some(id);
    }
    Ok(last_id)
}

impl Database {
    // ── Branches ──

    /// `main` first, then by creation time.
    pub fn list_branches(&self, user_id: &str, conversation_id: &str) -> Result<Vec<Branch>> {
        let conn = self.conn()?;
        get_owned(&conn, user_id, conversation_id)?;
        let sql = format!(
            "SELECT {} FROM conversation_branches WHERE conversation_id = ?1
             ORDER BY (branch_name = 'main') DESC, created_at ASC, rowid ASC",
            Branch::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![conversation_id], Branch::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_branch(&self, user_id: &str, conversation_id: &str, name: &str) -> Result<Branch> {
        let conn = self.conn()?;
        get_owned(&conn, user_id, conversation_id)?;
        get_branch(&conn, conversation_id, name)
    }

    pub fn active_branch(&self, user_id: &str, conversation_id: &str) -> Result<String> {
        let conn = self.conn()?;
        get_owned(&conn, user_id, conversation_id)?;
        active_branch_name(&conn, conversation_id)
    }

    /// Creates a branch and copies its history in a single transaction, so a
    /// failure never leaves a partially populated branch behind.
    pub fn create_branch(
        &self,
        user_id: &str,
        conversation_id: &str,
        new: NewBranch,
    ) -> Result<Branch> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        get_owned(&tx, user_id, conversation_id)?;

        let (source_branch, history) = match &new.source {
            BranchSource::Message(message_id) => {
                let fork = find_message(&tx, conversation_id, message_id)?
                    .ok_or(DbError::NotFound("message"))?;
                let history: Vec<Message> =
                    branch_messages(&tx, conversation_id, &fork.branch_name)?
                        .into_iter()
                        .filter(|m| m.created_at <= fork.created_at)
                        .collect();
                (fork.branch_name, history)
            }
            BranchSource::Active { up_to_index } => {
                let source = active_branch_name(&tx, conversation_id)?;
                let mut history = branch_messages(&tx, conversation_id, &source)?;
                if let Some(index) = *up_to_index {
                    if index >= history.len() {
                        return Err(DbError::Invalid(format!(
                            "message index {} out of range for branch with {} messages",
                            index,
                            history.len()
                        )));
                    }
                    history.truncate(index + 1);
                }
                (source, history)
            }
        };

        let branch_count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM conversation_branches WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        let display_name = new
            .display_name
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| format!("Branch {}", branch_count));

        let branch_name = match new.branch_name {
            Some(name) => {
                validate_branch_name(&name).map_err(DbError::Invalid)?;
                if name == MAIN_BRANCH || branch_exists(&tx, conversation_id, &name)? {
                    return Err(DbError::Conflict(format!("branch '{}' already exists", name)));
                }
                name
            }
            None => unique_slug(&tx, conversation_id, &slugify(&display_name))?,
        };

        let source_message_id = match &new.source {
            BranchSource::Message(id) => Some(id.clone()),
            BranchSource::Active { .. } => history.last().map(|m| m.id.clone()),
        };

        tx.execute(
            "INSERT INTO conversation_branches (id, conversation_id, branch_name, display_name,
                                                source_message_id, is_active, message_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)",
            params![
                new_id(),
                conversation_id,
                branch_name,
                display_name,
                source_message_id,
                history.len() as i64,
                now_timestamp()
            ],
        )?;
        copy_messages(&tx, &history, &branch_name)?;
        if new.activate {
            set_active(&tx, conversation_id, &branch_name)?;
        }
        touch(&tx, conversation_id)?;

        let branch = get_branch(&tx, conversation_id, &branch_name)?;
        tx.commit()?;

        tracing::info!(
            conversation_id,
            branch = %branch.branch_name,
            source = %source_branch,
            copied = history.len(),
            "branch created"
        );
        Ok(branch)
    }

    pub fn create_branch_from_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
        branch_name: Option<String>,
        display_name: Option<String>,
        activate: bool,
    ) -> Result<Branch> {
        self.create_branch(
            user_id,
            conversation_id,
            NewBranch {
                branch_name,
                display_name,
                source: BranchSource::Message(message_id.to_string()),
                activate,
            },
        )
    }

    pub fn rename_branch(
        &self,
        user_id: &str,
        conversation_id: &str,
        name: &str,
        display_name: &str,
    ) -> Result<Branch> {
        let conn = self.conn()?;
        get_owned(&conn, user_id, conversation_id)?;
        let changed = conn.execute(
            "UPDATE conversation_branches SET display_name = ?1
             WHERE conversation_id = ?2 AND branch_name = ?3",
            params![display_name, conversation_id, name],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound("branch"));
        }
        get_branch(&conn, conversation_id, name)
    }

    /// Makes `name` the only active branch of the conversation.
    pub fn activate_branch(
        &self,
        user_id: &str,
        conversation_id: &str,
        name: &str,
    ) -> Result<Branch> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        get_owned(&tx, user_id, conversation_id)?;
        get_branch(&tx, conversation_id, name)?;
        set_active(&tx, conversation_id, name)?;
        let branch = get_branch(&tx, conversation_id, name)?;
        tx.commit()?;
        Ok(branch)
    }

    /// Deletes a branch with its messages and share rows. `main` is protected;
    /// deleting the active branch reactivates `main`.
    pub fn delete_branch(&self, user_id: &str, conversation_id: &str, name: &str) -> Result<()> {
        if name == MAIN_BRANCH {
            return Err(DbError::Invalid("the main branch cannot be deleted".into()));
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        get_owned(&tx, user_id, conversation_id)?;
        let branch = get_branch(&tx, conversation_id, name)?;

        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1 AND branch_name = ?2",
            params![conversation_id, name],
        )?;
        tx.execute(
            "DELETE FROM shared_conversations WHERE conversation_id = ?1 AND branch_name = ?2",
            params![conversation_id, name],
        )?;
        tx.execute(
            "DELETE FROM conversation_branches WHERE id = ?1",
            params![branch.id],
        )?;
        if branch.is_active {
            set_active(&tx, conversation_id, MAIN_BRANCH)?;
        }
        refresh_shared_flag(&tx, conversation_id)?;
        tx.commit()?;

        tracing::info!(conversation_id, branch = name, "branch deleted");
        Ok(())
    }
}

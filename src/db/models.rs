use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Parses a JSON text column, reporting failures as a column conversion error.
fn json_column<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Conversation {
    pub id: String,
    #[serde(skip_serializing)]
    pub user_id: String,
    pub title: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub persona_id: Option<String>,
    pub is_shared: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Conversation {
    pub(crate) const COLUMNS: &'static str =
        "id, user_id, title, model, system_prompt, persona_id, is_shared, created_at, updated_at";

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Conversation {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            model: row.get(3)?,
            system_prompt: row.get(4)?,
            persona_id: row.get(5)?,
            is_shared: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

/// Reference to an uploaded attachment as embedded in a message.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub attachments: Vec<AttachmentRef>,
    pub branch_name: String,
    pub parent_message_id: Option<String>,
    pub model: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub created_at: String,
}

impl Message {
    pub(crate) const COLUMNS: &'static str = "id, conversation_id, role, content, attachments, \
         branch_name, parent_message_id, model, prompt_tokens, completion_tokens, created_at";

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Message {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            attachments: json_column(row, 4)?,
            branch_name: row.get(5)?,
            parent_message_id: row.get(6)?,
            model: row.get(7)?,
            prompt_tokens: row.get(8)?,
            completion_tokens: row.get(9)?,
            created_at: row.get(10)?,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Branch {
    pub id: String,
    pub conversation_id: String,
    pub branch_name: String,
    pub display_name: String,
    pub source_message_id: Option<String>,
    pub is_active: bool,
    pub message_count: i64,
    pub created_at: String,
}

impl Branch {
    pub(crate) const COLUMNS: &'static str = "id, conversation_id, branch_name, display_name, \
         source_message_id, is_active, message_count, created_at";

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Branch {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            branch_name: row.get(2)?,
            display_name: row.get(3)?,
            source_message_id: row.get(4)?,
            is_active: row.get(5)?,
            message_count: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SharedConversation {
    pub id: String,
    pub token: String,
    pub conversation_id: String,
    pub branch_name: String,
    #[serde(skip_serializing)]
    pub user_id: String,
    pub expires_at: Option<String>,
    pub view_count: i64,
    pub created_at: String,
}

impl SharedConversation {
    pub(crate) const COLUMNS: &'static str =
        "id, token, conversation_id, branch_name, user_id, expires_at, view_count, created_at";

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(SharedConversation {
            id: row.get(0)?,
            token: row.get(1)?,
            conversation_id: row.get(2)?,
            branch_name: row.get(3)?,
            user_id: row.get(4)?,
            expires_at: row.get(5)?,
            view_count: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Attachment {
    pub id: String,
    #[serde(skip_serializing)]
    pub user_id: String,
    pub storage_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    #[serde(skip_serializing)]
    pub extracted_text: Option<String>,
    pub message_id: Option<String>,
    pub created_at: String,
}

impl Attachment {
    pub(crate) const COLUMNS: &'static str = "id, user_id, storage_path, file_name, mime_type, \
         size_bytes, extracted_text, message_id, created_at";

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Attachment {
            id: row.get(0)?,
            user_id: row.get(1)?,
            storage_path: row.get(2)?,
            file_name: row.get(3)?,
            mime_type: row.get(4)?,
            size_bytes: row.get(5)?,
            extracted_text: row.get(6)?,
            message_id: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    pub fn to_ref(&self) -> AttachmentRef {
        AttachmentRef {
            id: self.id.clone(),
            file_name: self.file_name.clone(),
            mime_type: self.mime_type.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Persona {
    pub id: String,
    #[serde(skip_serializing)]
    pub user_id: String,
    pub name: String,
    pub system_prompt: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
    pub is_default: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Persona {
    pub(crate) const COLUMNS: &'static str = "id, user_id, name, system_prompt, temperature, \
         max_tokens, is_default, created_at, updated_at";

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Persona {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            system_prompt: row.get(3)?,
            temperature: row.get(4)?,
            max_tokens: row.get(5)?,
            is_default: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PersonaMemory {
    pub id: String,
    pub persona_id: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserApiKey {
    pub provider: String,
    pub encrypted_key: String,
    pub iv: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct UserSettings {
    pub default_model: Option<String>,
    pub default_persona_id: Option<String>,
    pub theme: Option<String>,
    pub preferences: serde_json::Value,
    pub updated_at: Option<String>,
}

use super::{ApiJson, AppState};
use crate::auth::AuthUser;
use crate::db::conversations::{ConversationUpdate, NewConversation};
use crate::db::models::{Conversation, Message};
use crate::error::{AppError, FieldError, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

pub const MAX_TITLE_CHARS: usize = 60;
const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Conversation>>> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let conversations =
        state
            .db
            .list_conversations(&user.id, limit, params.offset.unwrap_or(0))?;
    Ok(Json(conversations))
}

#[derive(Debug, Deserialize)]
pub struct CreateConversation {
    pub id: Option<String>,
    pub title: Option<String>,
    pub model: String,
    pub system_prompt: Option<String>,
    pub persona_id: Option<String>,
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ApiJson(body): ApiJson<CreateConversation>,
) -> Result<(StatusCode, Json<Conversation>)> {
    let mut errors = Vec::new();
    if body.model.trim().is_empty() {
        errors.push(FieldError::new("model", "model is required"));
    }
    if let Some(id) = &body.id {
        if id.trim().is_empty() || id.len() > 64 {
            errors.push(FieldError::new("id", "id must be 1-64 characters"));
        }
    }
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }
    if let Some(persona_id) = &body.persona_id {
        state.db.get_persona(&user.id, persona_id)?;
    }

    let conversation = state.db.create_conversation(
        &user.id,
        NewConversation {
            id: body.id,
            title: body
                .title
                .map(|t| truncate_title(&t))
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "New conversation".to_string()),
            model: body.model,
            system_prompt: body.system_prompt,
            persona_id: body.persona_id,
        },
    )?;
    tracing::info!(conversation_id = %conversation.id, "conversation created");
    Ok((StatusCode::CREATED, Json(conversation)))
}

pub async fn fetch(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Conversation>> {
    Ok(Json(state.db.get_conversation(&user.id, &id)?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateConversation {
    pub title: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub persona_id: Option<String>,
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<UpdateConversation>,
) -> Result<Json<Conversation>> {
    if matches!(&body.title, Some(t) if t.trim().is_empty()) {
        return Err(AppError::field("title", "title cannot be empty"));
    }
    if matches!(&body.model, Some(m) if m.trim().is_empty()) {
        return Err(AppError::field("model", "model cannot be empty"));
    }
    if let Some(persona_id) = &body.persona_id {
        state.db.get_persona(&user.id, persona_id)?;
    }

    let conversation = state.db.update_conversation(
        &user.id,
        &id,
        ConversationUpdate {
            title: body.title.map(|t| truncate_title(&t)),
            model: body.model,
            system_prompt: body.system_prompt,
            persona_id: body.persona_id,
        },
    )?;
    Ok(Json(conversation))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.db.delete_conversation(&user.id, &id)?;
    tracing::info!(conversation_id = %id, "conversation deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct MessageParams {
    pub branch: Option<String>,
}

pub async fn messages(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
    Query(params): Query<MessageParams>,
) -> Result<Json<Vec<Message>>> {
    let messages = state
        .db
        .list_messages(&user.id, &id, params.branch.as_deref())?;
    Ok(Json(messages))
}

/// Collapses whitespace and cuts a title to at most 60 characters.
pub fn truncate_title(text: &str) -> String {
    let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    line.chars().take(MAX_TITLE_CHARS).collect::<String>().trim_end().to_string()
}

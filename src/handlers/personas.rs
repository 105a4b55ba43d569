use super::{ApiJson, AppState};
use crate::auth::AuthUser;
use crate::db::models::{Persona, PersonaMemory};
use crate::db::personas::{NewPersona, PersonaUpdate};
use crate::error::{AppError, FieldError, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

const MAX_NAME_CHARS: usize = 100;
const MAX_MEMORY_CHARS: usize = 2000;

#[derive(Debug, Deserialize)]
pub struct PersonaBody {
    pub name: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
    pub is_default: Option<bool>,
}

fn validate(body: &PersonaBody, creating: bool) -> Result<()> {
    let mut errors = Vec::new();
    match body.name.as_deref().map(str::trim) {
        None if creating => errors.push(FieldError::new("name", "name is required")),
        Some("") => errors.push(FieldError::new("name", "name cannot be empty")),
        Some(name) if name.chars().count() > MAX_NAME_CHARS => errors.push(FieldError::new(
            "name",
            format!("name is limited to {} characters", MAX_NAME_CHARS),
        )),
        _ => {}
    }
    if creating && body.system_prompt.is_none() {
        errors.push(FieldError::new("system_prompt", "system prompt is required"));
    }
    if let Some(t) = body.temperature {
        if !(0.0..=2.0).contains(&t) {
            errors.push(FieldError::new("temperature", "temperature must be between 0 and 2"));
        }
    }
    if let Some(m) = body.max_tokens {
        if m <= 0 {
            errors.push(FieldError::new("max_tokens", "max_tokens must be positive"));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(errors))
    }
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<Vec<Persona>>> {
    Ok(Json(state.db.list_personas(&user.id)?))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ApiJson(body): ApiJson<PersonaBody>,
) -> Result<(StatusCode, Json<Persona>)> {
    validate(&body, true)?;
    let persona = state.db.create_persona(
        &user.id,
        NewPersona {
            name: body.name.unwrap_or_default().trim().to_string(),
            system_prompt: body.system_prompt.unwrap_or_default(),
            temperature: body.temperature,
            max_tokens: body.max_tokens,
            is_default: body.is_default.unwrap_or(false),
        },
    )?;
    Ok((StatusCode::CREATED, Json(persona)))
}

pub async fn fetch(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Persona>> {
    Ok(Json(state.db.get_persona(&user.id, &id)?))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<PersonaBody>,
) -> Result<Json<Persona>> {
    validate(&body, false)?;
    let persona = state.db.update_persona(
        &user.id,
        &id,
        PersonaUpdate {
            name: body.name.map(|n| n.trim().to_string()),
            system_prompt: body.system_prompt,
            temperature: body.temperature,
            max_tokens: body.max_tokens,
            is_default: body.is_default,
        },
    )?;
    Ok(Json(persona))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.db.delete_persona(&user.id, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Memories ──

#[derive(Debug, Deserialize)]
pub struct MemoryBody {
    pub content: String,
}

pub async fn list_memories(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<PersonaMemory>>> {
    Ok(Json(state.db.list_memories(&user.id, &id)?))
}

pub async fn add_memory(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<MemoryBody>,
) -> Result<(StatusCode, Json<PersonaMemory>)> {
    let content = body.content.trim();
    if content.is_empty() {
        return Err(AppError::field("content", "content is required"));
    }
    if content.chars().count() > MAX_MEMORY_CHARS {
        return Err(AppError::field(
            "content",
            format!("memories are limited to {} characters", MAX_MEMORY_CHARS),
        ));
    }
    let memory = state.db.add_memory(&user.id, &id, content)?;
    Ok((StatusCode::CREATED, Json(memory)))
}

pub async fn delete_memory(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((id, memory_id)): Path<(String, String)>,
) -> Result<StatusCode> {
    state.db.delete_memory(&user.id, &id, &memory_id)?;
    Ok(StatusCode::NO_CONTENT)
}

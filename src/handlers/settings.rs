use super::{ApiJson, AppState};
use crate::auth::AuthUser;
use crate::db::models::{UserApiKey, UserSettings};
use crate::db::settings::SettingsPatch;
use crate::error::{AppError, Result};
use crate::llm::ModelInfo;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

const THEMES: &[&str] = &["light", "dark", "system"];

pub async fn list_models(State(state): State<Arc<AppState>>, _user: AuthUser) -> Json<Vec<ModelInfo>> {
    Json(state.config.models())
}

// ── API keys ──

#[derive(Debug, Deserialize)]
pub struct PutKey {
    pub encrypted_key: String,
    pub iv: Option<String>,
}

pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<Vec<UserApiKey>>> {
    Ok(Json(state.db.list_api_keys(&user.id)?))
}

pub async fn put_key(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(provider): Path<String>,
    ApiJson(body): ApiJson<PutKey>,
) -> Result<Json<UserApiKey>> {
    if state.config.provider(&provider).is_none() {
        return Err(AppError::NotFound(format!("provider {}", provider)));
    }
    if body.encrypted_key.trim().is_empty() {
        return Err(AppError::field("encrypted_key", "encrypted_key is required"));
    }
    let key = state
        .db
        .upsert_api_key(&user.id, &provider, &body.encrypted_key, body.iv.as_deref())?;
    tracing::info!(provider = %provider, "api key stored");
    Ok(Json(key))
}

pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(provider): Path<String>,
) -> Result<StatusCode> {
    state.db.delete_api_key(&user.id, &provider)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Settings ──

#[derive(Debug, Deserialize)]
pub struct PatchSettings {
    pub default_model: Option<String>,
    pub default_persona_id: Option<String>,
    pub theme: Option<String>,
    pub preferences: Option<serde_json::Map<String, serde_json::Value>>,
}

pub async fn get_settings(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<UserSettings>> {
    Ok(Json(state.db.get_settings(&user.id)?))
}

pub async fn patch_settings(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ApiJson(body): ApiJson<PatchSettings>,
) -> Result<Json<UserSettings>> {
    if let Some(theme) = &body.theme {
        if !THEMES.contains(&theme.as_str()) {
            return Err(AppError::field(
                "theme",
                format!("theme must be one of: {}", THEMES.join(", ")),
            ));
        }
    }
    if let Some(model) = &body.default_model {
        if !state.config.models().iter().any(|m| &m.id == model) {
            return Err(AppError::field("default_model", format!("unknown model {}", model)));
        }
    }
    if let Some(persona_id) = &body.default_persona_id {
        state.db.get_persona(&user.id, persona_id)?;
    }

    let settings = state.db.patch_settings(
        &user.id,
        SettingsPatch {
            default_model: body.default_model,
            default_persona_id: body.default_persona_id,
            theme: body.theme,
            preferences: body.preferences,
        },
    )?;
    Ok(Json(settings))
}

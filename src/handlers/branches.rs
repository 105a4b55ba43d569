use super::{ApiJson, AppState};
use crate::auth::AuthUser;
use crate::db::branches::{validate_branch_name, BranchSource, NewBranch};
use crate::db::models::Branch;
use crate::error::{AppError, FieldError, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

const MAX_DISPLAY_NAME_CHARS: usize = 100;

fn default_activate() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct CreateBranch {
    pub branch_name: Option<String>,
    pub display_name: Option<String>,
    /// Fork at this message instead of cloning the active branch.
    pub source_message_id: Option<String>,
    /// Zero-based, inclusive. Only used when cloning the active branch.
    pub up_to_index: Option<usize>,
    #[serde(default = "default_activate")]
    pub activate: bool,
}

fn validate_names(branch_name: Option<&str>, display_name: Option<&str>) -> Result<()> {
    let mut errors = Vec::new();
    if let Some(name) = branch_name {
        if let Err(message) = validate_branch_name(name) {
            errors.push(FieldError::new("branch_name", message));
        }
    }
    if let Some(display) = display_name {
        if display.chars().count() > MAX_DISPLAY_NAME_CHARS {
            errors.push(FieldError::new(
                "display_name",
                format!("display name is limited to {} characters", MAX_DISPLAY_NAME_CHARS),
            ));
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
    Path(id): Path<String>,
) -> Result<Json<Vec<Branch>>> {
    Ok(Json(state.db.list_branches(&user.id, &id)?))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<CreateBranch>,
) -> Result<(StatusCode, Json<Branch>)> {
    validate_names(body.branch_name.as_deref(), body.display_name.as_deref())?;
    if body.source_message_id.is_some() && body.up_to_index.is_some() {
        return Err(AppError::field(
            "up_to_index",
            "up_to_index cannot be combined with source_message_id",
        ));
    }

    let source = match body.source_message_id {
        Some(message_id) => BranchSource::Message(message_id),
        None => BranchSource::Active {
            up_to_index: body.up_to_index,
        },
    };
    let branch = state.db.create_branch(
        &user.id,
        &id,
        NewBranch {
            branch_name: body.branch_name,
            display_name: body.display_name,
            source,
            activate: body.activate,
        },
    )?;
    Ok((StatusCode::CREATED, Json(branch)))
}

#[derive(Debug, Deserialize)]
pub struct BranchFromMessage {
    pub branch_name: Option<String>,
    pub display_name: Option<String>,
}

/// Forks at a message and switches the conversation to the new branch.
pub async fn branch_from_message(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((id, message_id)): Path<(String, String)>,
    body: Option<ApiJson<BranchFromMessage>>,
) -> Result<(StatusCode, Json<Branch>)> {
    let (branch_name, display_name) = match body {
        Some(ApiJson(body)) => (body.branch_name, body.display_name),
        None => (None, None),
    };
    validate_names(branch_name.as_deref(), display_name.as_deref())?;

    let branch = state.db.create_branch_from_message(
        &user.id,
        &id,
        &message_id,
        branch_name,
        display_name,
        true,
    )?;
    Ok((StatusCode::CREATED, Json(branch)))
}

#[derive(Debug, Deserialize)]
pub struct RenameBranch {
    pub display_name: String,
}

pub async fn rename(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((id, branch)): Path<(String, String)>,
    ApiJson(body): ApiJson<RenameBranch>,
) -> Result<Json<Branch>> {
    let display_name = body.display_name.trim();
    if display_name.is_empty() {
        return Err(AppError::field("display_name", "display name is required"));
    }
    validate_names(None, Some(display_name))?;
    Ok(Json(
        state
            .db
            .rename_branch(&user.id, &id, &branch, display_name)?,
    ))
}

pub async fn activate(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((id, branch)): Path<(String, String)>,
) -> Result<Json<Branch>> {
    Ok(Json(state.db.activate_branch(&user.id, &id, &branch)?))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((id, branch)): Path<(String, String)>,
) -> Result<StatusCode> {
    state.db.delete_branch(&user.id, &id, &branch)?;
    Ok(StatusCode::NO_CONTENT)
}

use super::{ApiJson, AppState};
use crate::auth::AuthUser;
use crate::db::models::SharedConversation;
use crate::db::shares::{NewShare, SharedTranscript};
use crate::db::format_timestamp;
use crate::error::{AppError, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct CreateShare {
    /// Defaults to the active branch.
    pub branch_name: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expires_in_hours: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ShareResponse {
    #[serde(flatten)]
    pub share: SharedConversation,
    pub url: String,
}

fn share_url(state: &AppState, token: &str) -> String {
    format!(
        "{}/shared/{}",
        state.config.server.public_url.trim_end_matches('/'),
        token
    )
}

fn resolve_expiry(body: &CreateShare) -> Result<Option<String>> {
    match (body.expires_at, body.expires_in_hours) {
        (Some(_), Some(_)) => Err(AppError::field(
            "expires_at",
            "use either expires_at or expires_in_hours",
        )),
        (Some(at), None) => Ok(Some(format_timestamp(at))),
        (None, Some(hours)) if hours <= 0 => Err(AppError::field(
            "expires_in_hours",
            "expires_in_hours must be positive",
        )),
        (None, Some(hours)) => Duration::try_hours(hours)
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .map(|at| Some(format_timestamp(at)))
            .ok_or_else(|| AppError::field("expires_in_hours", "expires_in_hours is too large")),
        (None, None) => Ok(None),
    }
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<CreateShare>,
) -> Result<(StatusCode, Json<ShareResponse>)> {
    let expires_at = resolve_expiry(&body)?;
    let branch_name = match body.branch_name {
        Some(name) => name,
        None => state.db.active_branch(&user.id, &id)?,
    };

    let share = state.db.create_share(
        &user.id,
        NewShare {
            conversation_id: id,
            branch_name,
            expires_at,
        },
    )?;
    tracing::info!(
        conversation_id = %share.conversation_id,
        branch = %share.branch_name,
        "conversation shared"
    );
    let url = share_url(&state, &share.token);
    Ok((StatusCode::CREATED, Json(ShareResponse { share, url })))
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<ShareResponse>>> {
    let shares = state
        .db
        .list_shares(&user.id, &id)?
        .into_iter()
        .map(|share| ShareResponse {
            url: share_url(&state, &share.token),
            share,
        })
        .collect();
    Ok(Json(shares))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((id, share_id)): Path<(String, String)>,
) -> Result<StatusCode> {
    state.db.delete_share(&user.id, &id, &share_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Public, unauthenticated transcript of one shared branch.
pub async fn view(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<SharedTranscript>> {
    let transcript = state.db.resolve_share(&token)?;

    // View counts are advisory; a failed increment never fails the read.
    let counter = state.clone();
    tokio::spawn(async move {
        if let Err(e) = counter.db.increment_share_views(&token) {
            tracing::warn!("failed to record share view: {}", e);
        }
    });

    Ok(Json(transcript))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(expires_at: Option<DateTime<Utc>>, hours: Option<i64>) -> CreateShare {
        CreateShare {
            branch_name: None,
            expires_at,
            expires_in_hours: hours,
        }
    }

    #[test]
    fn test_resolve_expiry() {
        assert_eq!(resolve_expiry(&body(None, None)).unwrap(), None);
        assert!(resolve_expiry(&body(None, Some(24))).unwrap().is_some());
        assert!(resolve_expiry(&body(None, Some(0))).is_err());
        assert!(resolve_expiry(&body(Some(Utc::now()), Some(1))).is_err());
        assert!(matches!(
            resolve_expiry(&body(None, Some(9_000_000_000_000))),
            Err(AppError::Validation(_))
        ));
        assert!(resolve_expiry(&body(None, Some(i64::MAX))).is_err());
    }
}

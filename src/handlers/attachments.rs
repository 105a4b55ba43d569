use super::AppState;
use crate::auth::AuthUser;
use crate::db::attachments::NewAttachment;
use crate::db::models::Attachment;
use crate::doc_processor::{extract_text, is_allowed_mime, normalize_mime};
use crate::error::{AppError, Result};
use crate::storage::{object_path, SignedUrl};
use axum::body::Bytes;
use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct AttachmentResponse {
    #[serde(flatten)]
    pub attachment: Attachment,
    #[serde(flatten)]
    pub signed: SignedUrl,
}

struct UploadedFile {
    file_name: String,
    mime_type: String,
    bytes: Bytes,
}

fn multipart_error(err: MultipartError, max_bytes: usize) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(max_bytes)
    } else {
        AppError::from(err)
    }
}

/// Reads the `file` field. Size and type are checked before anything is stored.
async fn read_file_field(multipart: &mut Multipart, max_bytes: usize) -> Result<UploadedFile> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, max_bytes))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| "upload".to_string());
        let mime_type = normalize_mime(field.content_type(), &file_name);

        let bytes = field
            .bytes()
            .await
            .map_err(|e| multipart_error(e, max_bytes))?;
        if bytes.len() > max_bytes {
            return Err(AppError::PayloadTooLarge(max_bytes));
        }
        if !is_allowed_mime(&mime_type) {
            return Err(AppError::UnsupportedMediaType(mime_type));
        }
        if bytes.is_empty() {
            return Err(AppError::field("file", "file is empty"));
        }
        return Ok(UploadedFile {
            file_name,
            mime_type,
            bytes,
        });
    }
    Err(AppError::field("file", "multipart field 'file' is required"))
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<AttachmentResponse>)> {
    let file = read_file_field(&mut multipart, state.config.uploads.max_bytes).await?;

    let extracted_text = {
        let bytes = file.bytes.clone();
        let mime = file.mime_type.clone();
        match tokio::task::spawn_blocking(move || extract_text(&bytes, &mime)).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                tracing::warn!(file = %file.file_name, "text extraction failed: {}", e);
                None
            }
            Err(e) => {
                tracing::warn!(file = %file.file_name, "text extraction task failed: {}", e);
                None
            }
        }
    };

    let id = uuid::Uuid::new_v4().to_string();
    let path = object_path(&user.id, &id, &file.file_name);
    state.store.put(&path, &file.bytes).await?;

    let inserted = state.db.insert_attachment(
        &user.id,
        NewAttachment {
            id,
            storage_path: path.clone(),
            file_name: file.file_name,
            mime_type: file.mime_type,
            size_bytes: file.bytes.len() as i64,
            extracted_text,
        },
    );
    let attachment = match inserted {
        Ok(attachment) => attachment,
        Err(e) => {
            // Compensate: the object must not outlive a failed insert.
            if let Err(cleanup) = state.store.delete(&path).await {
                tracing::error!(path = %path, "failed to remove orphaned upload: {}", cleanup);
            }
            return Err(e.into());
        }
    };

    tracing::info!(
        attachment_id = %attachment.id,
        mime_type = %attachment.mime_type,
        size = attachment.size_bytes,
        "attachment stored"
    );
    let signed = state.signer.sign(&attachment.storage_path);
    Ok((
        StatusCode::CREATED,
        Json(AttachmentResponse { attachment, signed }),
    ))
}

pub async fn fetch(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<AttachmentResponse>> {
    let attachment = state.db.get_attachment(&user.id, &id)?;
    let signed = state.signer.sign(&attachment.storage_path);
    Ok(Json(AttachmentResponse { attachment, signed }))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let attachment = state.db.delete_attachment(&user.id, &id)?;
    if let Err(e) = state.store.delete(&attachment.storage_path).await {
        tracing::warn!(path = %attachment.storage_path, "failed to delete stored object: {}", e);
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct DownloadParams {
    pub expires: i64,
    pub signature: String,
}

/// Serves a stored object to anyone holding a valid signed link.
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    params: Option<Query<DownloadParams>>,
) -> Result<impl IntoResponse> {
    let Some(Query(params)) = params else {
        return Err(AppError::Forbidden);
    };
    if !state.signer.verify(&path, params.expires, &params.signature) {
        return Err(AppError::Forbidden);
    }
    let bytes = state.store.get(&path).await?;
    let mime_type = normalize_mime(None, &path);
    Ok(([(header::CONTENT_TYPE, mime_type)], bytes))
}

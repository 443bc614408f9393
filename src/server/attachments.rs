use std::sync::Arc;

use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use super::AppState;
use super::extract::IdPath;
use super::response::{ApiError, ApiResponse};
use crate::attachment::parse_id_list;
use crate::auth::RequireActor;

const MAX_UPLOAD_SIZE: usize = 32 * 1024 * 1024;

/// POST /attachments - multipart upload; the `file` field carries the bytes
/// and its file name, an optional `name` field overrides the name.
pub async fn create_attachment(
    RequireActor(actor): RequireActor,
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut content: Option<Vec<u8>> = None;
    let mut name: Option<String> = None;
    let mut content_type: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed to read multipart: {e}")))?
    {
        match field.name() {
            Some("file") => {
                if name.is_none() {
                    name = field.file_name().map(str::to_string);
                }
                content_type = field.content_type().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read file: {e}")))?;
                if data.len() > MAX_UPLOAD_SIZE {
                    return Err(ApiError::payload_too_large(format!(
                        "File size ({} bytes) exceeds maximum allowed size ({MAX_UPLOAD_SIZE} bytes)",
                        data.len()
                    )));
                }
                content = Some(data.to_vec());
            }
            Some("name") => {
                name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(format!("Failed to read name: {e}")))?,
                );
            }
            _ => {}
        }
    }

    let content = content.ok_or_else(|| ApiError::bad_request("File field is required"))?;
    let name = name.ok_or_else(|| ApiError::bad_request("Attachment name is required"))?;
    let attachment = state
        .attachments
        .put(&name, content_type.as_deref(), &content)
        .await?;
    tracing::info!(id = %attachment.id, size = attachment.size, actor = %actor.name, "attachment uploaded");

    Ok((StatusCode::CREATED, Json(ApiResponse::success(attachment))))
}

pub async fn get_attachment(
    State(state): State<Arc<AppState>>,
    Path(path): Path<IdPath>,
) -> impl IntoResponse {
    let attachment = state.attachments.describe(&path.id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(attachment)))
}

/// DELETE /attachments/{ids} - comma-separated ids, deleted independently.
/// Returns the outcome for each id.
pub async fn delete_attachments(
    RequireActor(_actor): RequireActor,
    State(state): State<Arc<AppState>>,
    Path(path): Path<IdPath>,
) -> Result<impl IntoResponse, ApiError> {
    let ids = parse_id_list(&path.id);
    if ids.is_empty() {
        return Err(ApiError::bad_request("at least one attachment id is required"));
    }
    let outcomes = state.attachments.delete_many(&ids).await;
    Ok(Json(ApiResponse::success(outcomes)))
}

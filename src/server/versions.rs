use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

use super::AppState;
use super::dto::{
    CreateVersionRequest, ListParams, PatchVersionRequest, ValidateParams, VersionActionRequest,
};
use super::extract::{ExpectedStamp, IdPath, VersionPath, Workspace};
use super::response::{ApiError, ApiResponse};
use super::templates;
use crate::auth::RequireActor;
use crate::types::AppVersion;
use crate::workflow::TransitionRequest;

/// Loads a version through its template so that both the workspace and the
/// template in the path have to match.
fn load(state: &AppState, workspace: &Workspace, path: &VersionPath) -> Result<AppVersion, ApiError> {
    templates::load(state, workspace, &path.id)?;
    let version = state.catalog.describe_version(&path.version_id)?;
    if version.app_template_id != path.id {
        return Err(ApiError::not_found(format!(
            "app version {} not found",
            path.version_id
        )));
    }
    Ok(version)
}

pub async fn list_versions(
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<IdPath>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    templates::load(&state, &workspace, &path.id)?;
    let query = params.into_query()?;
    let page = state.catalog.list_template_versions(&path.id, &query)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(page)))
}

pub async fn create_version(
    RequireActor(actor): RequireActor,
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<IdPath>,
    Query(validate): Query<ValidateParams>,
    Json(req): Json<CreateVersionRequest>,
) -> Result<Response, ApiError> {
    templates::load(&state, &workspace, &path.id)?;
    let request = req.into_request()?;
    if validate.dry_run() {
        let check = state.catalog.check_version_upload(&path.id, &request, &actor)?;
        return Ok(Json(ApiResponse::success(check)).into_response());
    }
    let version = state.catalog.create_version(&path.id, &request, &actor).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(version))).into_response())
}

pub async fn get_version(
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<VersionPath>,
) -> impl IntoResponse {
    let version = load(&state, &workspace, &path)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(version)))
}

pub async fn patch_version(
    RequireActor(actor): RequireActor,
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<VersionPath>,
    ExpectedStamp(stamp): ExpectedStamp,
    Json(req): Json<PatchVersionRequest>,
) -> impl IntoResponse {
    load(&state, &workspace, &path)?;
    let patch = req.into_patch()?;
    let version = state
        .catalog
        .patch_version(&path.version_id, &patch, stamp, &actor)
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(version)))
}

pub async fn delete_version(
    RequireActor(actor): RequireActor,
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<VersionPath>,
    ExpectedStamp(stamp): ExpectedStamp,
) -> impl IntoResponse {
    load(&state, &workspace, &path)?;
    let transitioned = state.catalog.delete_version(&path.version_id, stamp, &actor)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(transitioned)))
}

/// POST /apps/{id}/versions/{version_id}/action - one review workflow step
pub async fn version_action(
    RequireActor(actor): RequireActor,
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<VersionPath>,
    ExpectedStamp(stamp): ExpectedStamp,
    Json(req): Json<VersionActionRequest>,
) -> impl IntoResponse {
    load(&state, &workspace, &path)?;
    let mut request = TransitionRequest::new(req.action, actor);
    request.message = req.message;
    request.expected_stamp = stamp;
    let transitioned = state.catalog.version_action(&path.version_id, &request)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(transitioned)))
}

pub async fn list_version_audits(
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<VersionPath>,
) -> impl IntoResponse {
    load(&state, &workspace, &path)?;
    let audits = state.catalog.list_version_audits(&path.version_id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(audits)))
}

/// GET /apps/{id}/versions/{version_id}/package - the raw package archive
pub async fn get_version_package(
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<VersionPath>,
) -> Result<Response, ApiError> {
    load(&state, &workspace, &path)?;
    let download = state.catalog.get_version_package(&path.version_id).await?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/gzip"));

    let safe_filename: String = download
        .file_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_' || *c == '.')
        .collect();
    let safe_filename = if safe_filename.is_empty() {
        "package.tgz".to_string()
    } else {
        safe_filename
    };
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{safe_filename}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok((StatusCode::OK, headers, download.data).into_response())
}

/// GET /apps/{id}/versions/{version_id}/files - package files, base64 encoded
pub async fn get_version_files(
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<VersionPath>,
) -> impl IntoResponse {
    load(&state, &workspace, &path)?;
    let files = state.catalog.get_version_files(&path.version_id).await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(files)))
}

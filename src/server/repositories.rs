use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::dto::{
    CancelResponse, JobResponse, ListParams, RepoAction, RepoActionRequest, ValidateParams,
};
use super::extract::{ExpectedStamp, IdPath, Workspace};
use super::response::{ApiError, ApiResponse};
use super::AppState;
use crate::auth::RequireActor;
use crate::catalog::{CreateRepository, RepositoryPatch};
use crate::types::{Condition, Repository};

/// Loads a repository, hiding it when it lies outside the requested workspace.
fn load(state: &AppState, workspace: &Workspace, id: &str) -> Result<Repository, ApiError> {
    let repo = state.catalog.describe_repository(id)?;
    workspace.ensure(repo.workspace.as_deref(), &format!("repository {id}"))?;
    Ok(repo)
}

pub async fn list_repositories(
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let mut query = params.into_query()?;
    if let Some(ws) = workspace.0 {
        query = query.with_condition(Condition::exact("workspace", ws));
    }
    let page = state.catalog.list_repositories(&query)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(page)))
}

pub async fn create_repository(
    RequireActor(actor): RequireActor,
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Query(validate): Query<ValidateParams>,
    Json(mut req): Json<CreateRepository>,
) -> Result<Response, ApiError> {
    if workspace.0.is_some() {
        req.workspace = workspace.0;
    }
    if validate.dry_run() {
        let check = state.catalog.check_repository(&req, &actor).await?;
        return Ok(Json(ApiResponse::success(check)).into_response());
    }
    let repo = state.catalog.create_repository(&req, &actor)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(repo))).into_response())
}

pub async fn get_repository(
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<IdPath>,
) -> impl IntoResponse {
    let repo = load(&state, &workspace, &path.id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(repo)))
}

pub async fn patch_repository(
    RequireActor(actor): RequireActor,
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<IdPath>,
    ExpectedStamp(stamp): ExpectedStamp,
    Json(patch): Json<RepositoryPatch>,
) -> impl IntoResponse {
    load(&state, &workspace, &path.id)?;
    let repo = state.catalog.patch_repository(&path.id, &patch, stamp, &actor)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(repo)))
}

pub async fn delete_repository(
    RequireActor(actor): RequireActor,
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<IdPath>,
    ExpectedStamp(stamp): ExpectedStamp,
) -> impl IntoResponse {
    load(&state, &workspace, &path.id)?;
    state.catalog.delete_repository(&path.id, stamp, &actor)?;
    state.indexer.cancel(&path.id);
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn list_repository_events(
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<IdPath>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    load(&state, &workspace, &path.id)?;
    let query = params.into_query()?;
    let page = state.indexer.list_events(&path.id, &query)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(page)))
}

/// POST /repos/{id}/action - `index` starts (or joins) an index job and
/// returns without waiting for it; `cancel` stops the running one.
pub async fn repository_action(
    RequireActor(actor): RequireActor,
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<IdPath>,
    Json(req): Json<RepoActionRequest>,
) -> Result<Response, ApiError> {
    load(&state, &workspace, &path.id)?;
    state.catalog.authorize_index(&path.id, &actor)?;

    match req.action {
        RepoAction::Index => {
            let handle = state.indexer.trigger_index(&path.id)?;
            tracing::info!(
                repository_id = %path.id,
                job_id = handle.job_id(),
                coalesced = handle.coalesced(),
                actor = %actor.name,
                "index requested"
            );
            let body = JobResponse::from(&handle);
            Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(body))).into_response())
        }
        RepoAction::Cancel => {
            let cancelled = state.indexer.cancel(&path.id);
            let body = CancelResponse {
                repository_id: path.id,
                cancelled,
            };
            Ok(Json(ApiResponse::success(body)).into_response())
        }
    }
}

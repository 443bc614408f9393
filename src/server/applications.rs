use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use super::AppState;
use super::dto::{ListParams, UpgradeRequest};
use super::extract::{ExpectedStamp, IdPath, Workspace};
use super::response::{ApiError, ApiResponse};
use crate::auth::RequireActor;
use crate::release::{ApplicationPatch, ApplicationScope, CreateApplication, OrchestratorReport};
use crate::types::Application;

fn load(state: &AppState, workspace: &Workspace, id: &str) -> Result<Application, ApiError> {
    let app = state.releases.describe_application(id)?;
    workspace.ensure(Some(&app.workspace), &format!("application {id}"))?;
    Ok(app)
}

/// GET /applications?workspace=&cluster=&namespace= - any combination narrows
/// the list; the workspace route fixes the workspace.
pub async fn list_applications(
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Query(mut scope): Query<ApplicationScope>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    if workspace.0.is_some() {
        scope.workspace = workspace.0;
    }
    let query = params.into_query()?;
    let page = state.releases.list_applications(&scope, &query)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(page)))
}

pub async fn create_application(
    RequireActor(_actor): RequireActor,
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Json(mut req): Json<CreateApplication>,
) -> impl IntoResponse {
    if let Some(ws) = workspace.0 {
        req.workspace = ws;
    }
    let app = state.releases.create_application(&req).await?;
    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(app))))
}

pub async fn get_application(
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<IdPath>,
) -> impl IntoResponse {
    let app = load(&state, &workspace, &path.id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(app)))
}

pub async fn modify_application(
    RequireActor(_actor): RequireActor,
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<IdPath>,
    ExpectedStamp(stamp): ExpectedStamp,
    Json(patch): Json<ApplicationPatch>,
) -> impl IntoResponse {
    load(&state, &workspace, &path.id)?;
    let app = state.releases.modify_application(&path.id, &patch, stamp)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(app)))
}

pub async fn upgrade_application(
    RequireActor(_actor): RequireActor,
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<IdPath>,
    ExpectedStamp(stamp): ExpectedStamp,
    Json(req): Json<UpgradeRequest>,
) -> impl IntoResponse {
    load(&state, &workspace, &path.id)?;
    let app = state
        .releases
        .upgrade_application(&path.id, &req.version_id, stamp)
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(app)))
}

pub async fn delete_application(
    RequireActor(_actor): RequireActor,
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<IdPath>,
) -> impl IntoResponse {
    load(&state, &workspace, &path.id)?;
    state.releases.delete_application(&path.id).await?;
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn list_bindings(
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<IdPath>,
) -> impl IntoResponse {
    load(&state, &workspace, &path.id)?;
    let bindings = state.releases.list_bindings(&path.id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(bindings)))
}

/// POST /reconcile - outcome callback from the orchestrator. Replays and
/// stale reports come back as `ignored`.
pub async fn reconcile(
    State(state): State<Arc<AppState>>,
    Json(report): Json<OrchestratorReport>,
) -> impl IntoResponse {
    let outcome = state.releases.reconcile(&report)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(outcome)))
}

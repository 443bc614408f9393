use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;

use super::dto::{CreateTemplateRequest, ListParams, TemplateActionRequest};
use super::extract::{ExpectedStamp, IdPath, Workspace};
use super::response::{ApiError, ApiResponse};
use super::AppState;
use crate::auth::RequireActor;
use crate::catalog::TemplatePatch;
use crate::types::{AppTemplate, AppVersion, Condition};

#[derive(Debug, Serialize)]
pub struct CreateTemplateResponse {
    pub template: AppTemplate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<AppVersion>,
}

/// Loads a template, hiding it when it lies outside the requested workspace.
pub(super) fn load(state: &AppState, workspace: &Workspace, id: &str) -> Result<AppTemplate, ApiError> {
    let template = state.catalog.describe_template(id)?;
    workspace.ensure(template.workspace.as_deref(), &format!("app template {id}"))?;
    Ok(template)
}

pub async fn list_templates(
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let mut query = params.into_query()?;
    if let Some(ws) = workspace.0 {
        query = query.with_condition(Condition::exact("workspace", ws));
    }
    let page = state.catalog.list_templates(&query)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(page)))
}

pub async fn create_template(
    RequireActor(actor): RequireActor,
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Json(req): Json<CreateTemplateRequest>,
) -> impl IntoResponse {
    let request = req.into_request(workspace.0)?;
    let (template, version) = state.catalog.create_template(&request, &actor).await?;
    Ok::<_, ApiError>((
        StatusCode::CREATED,
        Json(ApiResponse::success(CreateTemplateResponse { template, version })),
    ))
}

pub async fn get_template(
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<IdPath>,
) -> impl IntoResponse {
    let template = load(&state, &workspace, &path.id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(template)))
}

pub async fn patch_template(
    RequireActor(actor): RequireActor,
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<IdPath>,
    ExpectedStamp(stamp): ExpectedStamp,
    Json(patch): Json<TemplatePatch>,
) -> impl IntoResponse {
    load(&state, &workspace, &path.id)?;
    let template = state.catalog.patch_template(&path.id, &patch, stamp, &actor)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(template)))
}

pub async fn delete_template(
    RequireActor(actor): RequireActor,
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<IdPath>,
    ExpectedStamp(stamp): ExpectedStamp,
) -> impl IntoResponse {
    load(&state, &workspace, &path.id)?;
    state.catalog.delete_template(&path.id, stamp, &actor)?;
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

/// POST /apps/{id}/action - suspend or recover a whole template
pub async fn template_action(
    RequireActor(actor): RequireActor,
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<IdPath>,
    Json(req): Json<TemplateActionRequest>,
) -> impl IntoResponse {
    load(&state, &workspace, &path.id)?;
    let template = state.catalog.template_action(&path.id, req.action, &actor)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(template)))
}

pub async fn list_template_audits(
    State(state): State<Arc<AppState>>,
    workspace: Workspace,
    Path(path): Path<IdPath>,
) -> impl IntoResponse {
    load(&state, &workspace, &path.id)?;
    let audits = state.catalog.workflow().list_template_audits(&path.id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(audits)))
}

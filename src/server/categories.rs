use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use super::AppState;
use super::dto::ListParams;
use super::extract::{ExpectedStamp, IdPath};
use super::response::{ApiError, ApiResponse};
use crate::auth::RequireActor;
use crate::catalog::{CategoryPatch, CreateCategory};

pub async fn list_categories(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let query = params.into_query()?;
    let page = state.catalog.list_categories(&query)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(page)))
}

pub async fn create_category(
    RequireActor(actor): RequireActor,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateCategory>,
) -> impl IntoResponse {
    let category = state.catalog.create_category(&req, &actor)?;
    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(category))))
}

pub async fn get_category(
    State(state): State<Arc<AppState>>,
    Path(path): Path<IdPath>,
) -> impl IntoResponse {
    let category = state.catalog.describe_category(&path.id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(category)))
}

pub async fn patch_category(
    RequireActor(actor): RequireActor,
    State(state): State<Arc<AppState>>,
    Path(path): Path<IdPath>,
    ExpectedStamp(stamp): ExpectedStamp,
    Json(patch): Json<CategoryPatch>,
) -> impl IntoResponse {
    let category = state.catalog.patch_category(&path.id, &patch, stamp, &actor)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(category)))
}

pub async fn delete_category(
    RequireActor(actor): RequireActor,
    State(state): State<Arc<AppState>>,
    Path(path): Path<IdPath>,
) -> impl IntoResponse {
    state.catalog.delete_category(&path.id, &actor)?;
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

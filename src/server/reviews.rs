use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};

use super::AppState;
use super::dto::ListParams;
use super::response::{ApiError, ApiResponse};

/// GET /reviews - submit, pass and reject records across all apps
pub async fn list_reviews(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let query = params.into_query()?;
    let page = state.catalog.list_reviews(&query)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(page)))
}

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{
    Router,
    routing::{get, post},
};

use super::{applications, attachments, categories, repositories, reviews, templates, versions};
use crate::attachment::{AttachmentStore, BlobStore};
use crate::catalog::Catalog;
use crate::config::IndexerConfig;
use crate::indexer::{Indexer, ManifestFetcher};
use crate::release::{Orchestrator, ReleaseManager};
use crate::store::Store;
use crate::workflow::WorkflowEngine;

/// Request bodies carry base64 packages, so allow well past axum's 2 MiB.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub catalog: Arc<Catalog>,
    pub indexer: Indexer,
    pub releases: Arc<ReleaseManager>,
    pub attachments: Arc<AttachmentStore>,
}

impl AppState {
    /// Wires the services around one store.
    pub fn new(
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        fetcher: Arc<dyn ManifestFetcher>,
        orchestrator: Arc<dyn Orchestrator>,
        indexer_config: IndexerConfig,
        instance_id: impl Into<String>,
    ) -> Self {
        let attachments = Arc::new(AttachmentStore::new(store.clone(), blobs));
        let workflow = Arc::new(WorkflowEngine::new(store.clone()));
        let catalog = Arc::new(Catalog::new(
            store.clone(),
            attachments.clone(),
            workflow,
            fetcher.clone(),
        ));
        let indexer = Indexer::new(store.clone(), fetcher, indexer_config, instance_id);
        let releases = Arc::new(ReleaseManager::new(store.clone(), orchestrator));
        Self {
            store,
            catalog,
            indexer,
            releases,
            attachments,
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status();

    tracing::info!(
        "{} {} {} {}ms",
        method,
        uri.path(),
        status.as_u16(),
        latency.as_millis()
    );

    response
}

/// Routes that also exist under `/workspaces/{workspace}`.
fn scoped_router() -> Router<Arc<AppState>> {
    Router::new()
        // Repositories
        .route(
            "/repos",
            get(repositories::list_repositories).post(repositories::create_repository),
        )
        .route(
            "/repos/{id}",
            get(repositories::get_repository)
                .patch(repositories::patch_repository)
                .delete(repositories::delete_repository),
        )
        .route("/repos/{id}/events", get(repositories::list_repository_events))
        .route("/repos/{id}/action", post(repositories::repository_action))
        // App templates
        .route(
            "/apps",
            get(templates::list_templates).post(templates::create_template),
        )
        .route(
            "/apps/{id}",
            get(templates::get_template)
                .patch(templates::patch_template)
                .delete(templates::delete_template),
        )
        .route("/apps/{id}/action", post(templates::template_action))
        .route("/apps/{id}/audits", get(templates::list_template_audits))
        // App versions
        .route(
            "/apps/{id}/versions",
            get(versions::list_versions).post(versions::create_version),
        )
        .route(
            "/apps/{id}/versions/{version_id}",
            get(versions::get_version)
                .patch(versions::patch_version)
                .delete(versions::delete_version),
        )
        .route(
            "/apps/{id}/versions/{version_id}/action",
            post(versions::version_action),
        )
        .route(
            "/apps/{id}/versions/{version_id}/audits",
            get(versions::list_version_audits),
        )
        .route(
            "/apps/{id}/versions/{version_id}/package",
            get(versions::get_version_package),
        )
        .route(
            "/apps/{id}/versions/{version_id}/files",
            get(versions::get_version_files),
        )
        // Applications
        .route(
            "/applications",
            get(applications::list_applications).post(applications::create_application),
        )
        .route(
            "/applications/{id}",
            get(applications::get_application)
                .patch(applications::modify_application)
                .delete(applications::delete_application),
        )
        .route("/applications/{id}/upgrade", post(applications::upgrade_application))
        .route("/applications/{id}/bindings", get(applications::list_bindings))
}

fn global_router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/categories",
            get(categories::list_categories).post(categories::create_category),
        )
        .route(
            "/categories/{id}",
            get(categories::get_category)
                .patch(categories::patch_category)
                .delete(categories::delete_category),
        )
        .route("/reviews", get(reviews::list_reviews))
        .route("/attachments", post(attachments::create_attachment))
        // `{id}` is a comma-separated list on delete
        .route(
            "/attachments/{id}",
            get(attachments::get_attachment).delete(attachments::delete_attachments),
        )
        .route("/reconcile", post(applications::reconcile))
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let api = global_router()
        .merge(scoped_router())
        .nest("/workspaces/{workspace}", scoped_router());

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

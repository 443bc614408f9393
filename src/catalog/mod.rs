//! Catalog service: repositories, app templates, versions, categories and
//! the review aggregate, on top of the store, the workflow engine and the
//! attachment store.

mod categories;
mod repositories;
mod templates;
pub mod validation;
mod versions;

pub use categories::{CategoryPatch, CreateCategory};
pub use repositories::{CreateRepository, RepositoryCheck, RepositoryPatch};
pub use templates::{CreateTemplate, TemplatePatch};
pub use versions::{CreateVersion, PackageCheck, PackageDownload, VersionPatch};

use std::sync::Arc;

use crate::attachment::AttachmentStore;
use crate::error::{Error, Result};
use crate::indexer::ManifestFetcher;
use crate::store::Store;
use crate::types::{Actor, AppTemplate, AppVersion, ListQuery, Page, Review, Role};
use crate::workflow::{WorkflowEngine, effective_roles};

pub struct Catalog {
    store: Arc<dyn Store>,
    attachments: Arc<AttachmentStore>,
    workflow: Arc<WorkflowEngine>,
    fetcher: Arc<dyn ManifestFetcher>,
}

impl Catalog {
    pub fn new(
        store: Arc<dyn Store>,
        attachments: Arc<AttachmentStore>,
        workflow: Arc<WorkflowEngine>,
        fetcher: Arc<dyn ManifestFetcher>,
    ) -> Self {
        Self {
            store,
            attachments,
            workflow,
            fetcher,
        }
    }

    pub fn workflow(&self) -> &WorkflowEngine {
        &self.workflow
    }

    pub fn list_reviews(&self, query: &ListQuery) -> Result<Page<Review>> {
        self.store.list_reviews(query)
    }

    fn template(&self, id: &str) -> Result<AppTemplate> {
        self.store
            .get_template(id)?
            .ok_or_else(|| Error::not_found(format!("app template {id}")))
    }

    fn version(&self, id: &str) -> Result<AppVersion> {
        self.store
            .get_version(id)?
            .ok_or_else(|| Error::not_found(format!("app version {id}")))
    }
}

/// Fails with `Unauthorized` unless the actor holds one of `any`.
fn require_roles(actor: &Actor, any: Role, what: &str) -> Result<()> {
    if actor.roles.expand_implied().intersects(any) {
        return Ok(());
    }
    tracing::warn!(actor = %actor.name, what, "operation denied");
    Err(Error::Unauthorized(format!("{} may not {what}", actor.name)))
}

/// Like [`require_roles`], counting template ownership.
fn require_template_roles(actor: &Actor, template: &AppTemplate, any: Role, what: &str) -> Result<()> {
    if effective_roles(actor, template).intersects(any) {
        return Ok(());
    }
    tracing::warn!(actor = %actor.name, app = %template.name, what, "operation denied");
    Err(Error::Unauthorized(format!("{} may not {what}", actor.name)))
}

/// Resolves the stamp a write should compare against.
fn resolve_stamp(current: i64, expected: Option<i64>, what: &str) -> Result<i64> {
    match expected {
        Some(expected) if expected != current => Err(Error::conflict(format!(
            "{what} is at stamp {current}, not {expected}"
        ))),
        _ => Ok(current),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

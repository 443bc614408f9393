mod filter;
mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::*;

/// Outcome of trying to take the indexing lease of a repository.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome {
    Acquired,
    HeldBy(IndexLease),
}

/// One write in an atomic catalog batch. Every update names the stamp the
/// writer read; a mismatch aborts the whole batch with `Conflict`.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogChange {
    InsertTemplate(AppTemplate),
    InsertVersion(AppVersion),
    UpdateVersionContent {
        version: AppVersion,
        expected_stamp: i64,
    },
    /// Sets the status; `actor` is recorded as `suspended_by` when suspending.
    SetTemplateStatus {
        template_id: String,
        expected_stamp: i64,
        status: TemplateStatus,
        actor: String,
    },
    TransitionVersion {
        version_id: String,
        expected_stamp: i64,
        transition: VersionTransition,
    },
}

/// A workflow edge to commit together with its audit record.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionTransition {
    pub from: VersionStatus,
    pub to: VersionStatus,
    pub action: VersionAction,
    pub actor: String,
    pub message: Option<String>,
}

/// A repository event before the store assigns its sequence and timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewRepoEvent<'a> {
    pub repository_id: &'a str,
    pub job_id: &'a str,
    pub kind: RepoEventKind,
    pub detail: Option<&'a str>,
}

/// Store defines the catalog persistence contract.
///
/// Every update that takes an `expected_stamp` is a compare-and-swap: it fails
/// with `Conflict` when the stored stamp differs and with `NotFound` when the
/// row is gone. Successful updates bump the stamp by one.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // Repository operations
    fn create_repository(&self, repo: &Repository) -> Result<()>;
    fn get_repository(&self, id: &str) -> Result<Option<Repository>>;
    fn list_repositories(&self, query: &ListQuery) -> Result<Page<Repository>>;
    fn update_repository(&self, repo: &Repository, expected_stamp: i64) -> Result<Repository>;
    /// Soft-deletes the repository with its templates and versions. Fails
    /// with `Conflict` while a non-deleted application uses one of its versions.
    fn delete_repository(&self, id: &str, expected_stamp: i64, actor: &str) -> Result<()>;
    fn count_repository_applications(&self, id: &str) -> Result<i64>;
    fn record_index_outcome(
        &self,
        id: &str,
        status: RepoStatus,
        indexed_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    fn list_repositories_due_for_sync(&self, now: DateTime<Utc>) -> Result<Vec<Repository>>;

    // Template operations
    fn create_template(&self, template: &AppTemplate, first_version: Option<&AppVersion>)
    -> Result<()>;
    fn get_template(&self, id: &str) -> Result<Option<AppTemplate>>;
    fn list_templates(&self, query: &ListQuery) -> Result<Page<AppTemplate>>;
    fn list_repository_templates(&self, repository_id: &str) -> Result<Vec<AppTemplate>>;
    fn update_template(&self, template: &AppTemplate, expected_stamp: i64) -> Result<AppTemplate>;
    /// Soft-deletes the template and its versions, recording an audit entry
    /// for each version.
    fn delete_template(&self, id: &str, expected_stamp: i64, actor: &str) -> Result<()>;

    // Version operations
    fn create_version(&self, version: &AppVersion) -> Result<()>;
    fn get_version(&self, id: &str) -> Result<Option<AppVersion>>;
    fn list_versions(&self, query: &ListQuery) -> Result<Page<AppVersion>>;
    fn list_template_versions(&self, template_id: &str) -> Result<Vec<AppVersion>>;
    fn update_version(&self, version: &AppVersion, expected_stamp: i64) -> Result<AppVersion>;
    /// Moves a version along a workflow edge and appends the audit record in
    /// one transaction.
    fn transition_version(
        &self,
        id: &str,
        expected_stamp: i64,
        transition: &VersionTransition,
    ) -> Result<(AppVersion, AuditRecord)>;
    /// Applications still pinning a version: any not deleting or deleted whose
    /// current or pending binding is the version.
    fn count_version_applications(&self, version_id: &str) -> Result<i64>;

    // Batched catalog writes
    /// Applies all changes and appends `event` in a single transaction.
    fn apply_catalog_changes(
        &self,
        changes: &[CatalogChange],
        event: Option<&NewRepoEvent<'_>>,
    ) -> Result<Option<RepoEvent>>;

    // Audit log
    fn list_audits(&self, version_id: &str) -> Result<Vec<AuditRecord>>;
    fn list_template_audits(&self, template_id: &str) -> Result<Vec<AuditRecord>>;
    fn list_reviews(&self, query: &ListQuery) -> Result<Page<Review>>;

    // Repository event log
    fn append_repo_event(&self, event: &NewRepoEvent<'_>) -> Result<RepoEvent>;
    fn list_repo_events(&self, repository_id: &str, query: &ListQuery) -> Result<Page<RepoEvent>>;
    fn last_repo_event(&self, repository_id: &str) -> Result<Option<RepoEvent>>;

    // Index leases
    fn acquire_index_lease(&self, lease: &IndexLease) -> Result<LeaseOutcome>;
    fn renew_index_lease(
        &self,
        repository_id: &str,
        job_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;
    fn release_index_lease(&self, repository_id: &str, job_id: &str) -> Result<bool>;
    fn get_index_lease(&self, repository_id: &str) -> Result<Option<IndexLease>>;

    // Application operations
    /// Inserts the application and its first binding.
    fn create_application(&self, app: &Application) -> Result<()>;
    fn get_application(&self, id: &str) -> Result<Option<Application>>;
    fn list_applications(&self, query: &ListQuery) -> Result<Page<Application>>;
    fn list_applications_in_status(&self, statuses: &[ApplicationStatus])
    -> Result<Vec<Application>>;
    fn update_application(&self, app: &Application, expected_stamp: i64) -> Result<Application>;
    /// Writes an upgrading application, refusing unless its pending version
    /// is still active.
    fn begin_upgrade(&self, app: &Application, expected_stamp: i64) -> Result<Application>;
    /// Updates the application and appends a binding for its current version.
    fn rebind_application(&self, app: &Application, expected_stamp: i64) -> Result<Application>;
    fn list_application_bindings(&self, id: &str) -> Result<Vec<ApplicationBinding>>;

    // Category operations
    fn create_category(&self, category: &Category) -> Result<()>;
    fn get_category(&self, id: &str) -> Result<Option<Category>>;
    fn list_categories(&self, query: &ListQuery) -> Result<Page<Category>>;
    fn update_category(&self, category: &Category, expected_stamp: i64) -> Result<Category>;
    fn delete_category(&self, id: &str) -> Result<bool>;

    // Attachment metadata
    fn create_attachment(&self, attachment: &Attachment) -> Result<()>;
    fn get_attachment(&self, id: &str) -> Result<Option<Attachment>>;
    /// Fails with `Conflict` while a live app version uses the attachment
    /// as its package.
    fn delete_attachment(&self, id: &str) -> Result<bool>;
    fn count_attachments_with_digest(&self, digest: &str) -> Result<i64>;

    fn close(&self) -> Result<()>;
}

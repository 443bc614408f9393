use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::validation::{validate_repo_name, validate_repo_url};
use super::{Catalog, non_empty, require_roles, resolve_stamp};
use crate::error::{Error, Result};
use crate::indexer::Manifest;
use crate::indexer::fetch::manifest_url;
use crate::types::{
    Actor, ListQuery, Page, RepoScope, RepoStatus, Repository, Role, timestamp_now,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateRepository {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub url: String,
    #[serde(default)]
    pub credential_ref: Option<String>,
    /// Set for workspace-scoped repositories; global otherwise.
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub sync_period_secs: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// An empty string clears the credential.
    #[serde(default)]
    pub credential_ref: Option<String>,
    /// Zero turns periodic sync off.
    #[serde(default)]
    pub sync_period_secs: Option<i64>,
}

fn validate_sync_period(secs: Option<i64>) -> Result<()> {
    match secs {
        Some(secs) if secs < 0 => Err(Error::validation("sync period cannot be negative")),
        _ => Ok(()),
    }
}

/// Result of a dry-run repository create: what the manifest currently holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepositoryCheck {
    pub url: String,
    pub manifest_url: String,
    pub templates: usize,
    pub versions: usize,
    /// The manifest continues on further pages.
    pub paged: bool,
}

fn build_repository(request: &CreateRepository) -> Result<Repository> {
    let name = request.name.trim();
    validate_repo_name(name)?;
    let url = request.url.trim();
    validate_repo_url(url)?;
    validate_sync_period(request.sync_period_secs)?;

    let workspace = non_empty(request.workspace.as_deref());
    let scope = if workspace.is_some() {
        RepoScope::Workspace
    } else {
        RepoScope::Global
    };

    let now = timestamp_now();
    Ok(Repository {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        description: request.description.clone(),
        url: url.trim_end_matches('/').to_string(),
        credential_ref: non_empty(request.credential_ref.as_deref()),
        scope,
        workspace,
        sync_period_secs: request.sync_period_secs.filter(|s| *s > 0),
        status: RepoStatus::Active,
        last_indexed_at: None,
        created_at: now,
        updated_at: now,
        stamp: 1,
    })
}

impl Catalog {
    pub fn create_repository(&self, request: &CreateRepository, actor: &Actor) -> Result<Repository> {
        require_roles(actor, Role::ADMIN, "create repositories")?;
        let repo = build_repository(request)?;
        self.store.create_repository(&repo)?;

        tracing::info!(
            id = %repo.id,
            name = %repo.name,
            scope = %repo.scope,
            actor = %actor.name,
            "repository created"
        );
        Ok(repo)
    }

    /// Checks a repository request and reads the first manifest page
    /// without storing anything.
    pub async fn check_repository(
        &self,
        request: &CreateRepository,
        actor: &Actor,
    ) -> Result<RepositoryCheck> {
        require_roles(actor, Role::ADMIN, "create repositories")?;
        let repo = build_repository(request)?;
        let url = manifest_url(&repo.url);
        let content = self
            .fetcher
            .fetch_page(&repo, &url)
            .await
            .map_err(|e| Error::validation(format!("cannot read manifest at {url}: {e}")))?;
        let manifest = Manifest::from_yaml(&content)?;

        tracing::debug!(url = %url, versions = manifest.version_count(), "repository checked");
        Ok(RepositoryCheck {
            url: repo.url,
            manifest_url: url,
            templates: manifest.entries.len(),
            versions: manifest.version_count(),
            paged: manifest.next.is_some(),
        })
    }

    pub fn describe_repository(&self, id: &str) -> Result<Repository> {
        self.store
            .get_repository(id)?
            .ok_or_else(|| Error::not_found(format!("repository {id}")))
    }

    pub fn list_repositories(&self, query: &ListQuery) -> Result<Page<Repository>> {
        self.store.list_repositories(query)
    }

    pub fn patch_repository(
        &self,
        id: &str,
        patch: &RepositoryPatch,
        expected_stamp: Option<i64>,
        actor: &Actor,
    ) -> Result<Repository> {
        require_roles(actor, Role::ADMIN, "modify repositories")?;
        let current = self.describe_repository(id)?;
        if current.status == RepoStatus::Deleted {
            return Err(Error::invalid_state(format!("repository {id} is deleted")));
        }
        let stamp = resolve_stamp(current.stamp, expected_stamp, "repository")?;

        let mut next = current.clone();
        if let Some(name) = &patch.name {
            validate_repo_name(name.trim())?;
            next.name = name.trim().to_string();
        }
        if let Some(description) = &patch.description {
            next.description = Some(description.clone());
        }
        if let Some(url) = &patch.url {
            validate_repo_url(url.trim())?;
            next.url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(credential_ref) = &patch.credential_ref {
            next.credential_ref = non_empty(Some(credential_ref));
        }
        if let Some(secs) = patch.sync_period_secs {
            validate_sync_period(Some(secs))?;
            next.sync_period_secs = Some(secs).filter(|s| *s > 0);
        }

        let updated = self.store.update_repository(&next, stamp)?;
        tracing::info!(id, name = %updated.name, stamp = updated.stamp, "repository updated");
        Ok(updated)
    }

    /// Checks that the actor may start or cancel index jobs on a live repository.
    pub fn authorize_index(&self, id: &str, actor: &Actor) -> Result<Repository> {
        require_roles(actor, Role::ADMIN, "index repositories")?;
        let repo = self.describe_repository(id)?;
        if repo.status == RepoStatus::Deleted {
            return Err(Error::invalid_state(format!("repository {id} is deleted")));
        }
        Ok(repo)
    }

    /// Soft-deletes the repository with everything indexed from it.
    pub fn delete_repository(&self, id: &str, expected_stamp: Option<i64>, actor: &Actor) -> Result<()> {
        require_roles(actor, Role::ADMIN, "delete repositories")?;
        let current = self.describe_repository(id)?;
        if current.status == RepoStatus::Deleted {
            return Err(Error::not_found(format!("repository {id}")));
        }
        let stamp = resolve_stamp(current.stamp, expected_stamp, "repository")?;

        self.store
            .delete_repository(id, stamp, &actor.name)
            .inspect_err(|e| tracing::warn!(id, error = %e, "repository delete refused"))?;
        tracing::info!(id, name = %current.name, actor = %actor.name, "repository deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{admin, alice, catalog};

    fn request(name: &str) -> CreateRepository {
        CreateRepository {
            name: name.into(),
            url: "https://charts.example.com/".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_requires_admin_and_valid_url() {
        let (catalog, _) = catalog();
        assert!(matches!(
            catalog.create_repository(&request("stable"), &alice()).unwrap_err(),
            Error::Unauthorized(_)
        ));

        let mut bad = request("stable");
        bad.url = "ftp://charts.example.com".into();
        assert!(matches!(
            catalog.create_repository(&bad, &admin()).unwrap_err(),
            Error::ValidationFailed(_)
        ));

        let repo = catalog.create_repository(&request("stable"), &admin()).unwrap();
        assert_eq!(repo.scope, RepoScope::Global);
        assert_eq!(repo.url, "https://charts.example.com");
        assert!(matches!(
            catalog.create_repository(&request("stable"), &admin()).unwrap_err(),
            Error::AlreadyExists(_)
        ));
    }

    #[tokio::test]
    async fn test_check_reports_unreachable_manifest_without_storing() {
        let (catalog, _) = catalog();
        assert!(matches!(
            catalog.check_repository(&request("stable"), &alice()).await.unwrap_err(),
            Error::Unauthorized(_)
        ));

        let err = catalog
            .check_repository(&request("stable"), &admin())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)), "{err:?}");
        assert!(err.to_string().contains("https://charts.example.com/index.yaml"));
        assert_eq!(catalog.list_repositories(&ListQuery::new()).unwrap().total, 0);
    }

    #[test]
    fn test_workspace_scope_follows_workspace() {
        let (catalog, _) = catalog();
        let mut req = request("team");
        req.workspace = Some("ws1".into());
        let repo = catalog.create_repository(&req, &admin()).unwrap();
        assert_eq!(repo.scope, RepoScope::Workspace);
        assert!(!repo.is_trusted());
    }

    #[test]
    fn test_patch_is_compare_and_swap() {
        let (catalog, _) = catalog();
        let repo = catalog.create_repository(&request("stable"), &admin()).unwrap();
        let patch = RepositoryPatch {
            description: Some("curated".into()),
            sync_period_secs: Some(600),
            ..Default::default()
        };

        let updated = catalog
            .patch_repository(&repo.id, &patch, Some(repo.stamp), &admin())
            .unwrap();
        assert_eq!(updated.stamp, repo.stamp + 1);
        assert_eq!(updated.sync_period_secs, Some(600));

        let err = catalog
            .patch_repository(&repo.id, &patch, Some(repo.stamp), &admin())
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_delete_hides_repository() {
        let (catalog, _) = catalog();
        let repo = catalog.create_repository(&request("stable"), &admin()).unwrap();
        catalog.delete_repository(&repo.id, None, &admin()).unwrap();

        assert_eq!(catalog.list_repositories(&ListQuery::new()).unwrap().total, 0);
        assert_eq!(
            catalog.describe_repository(&repo.id).unwrap().status,
            RepoStatus::Deleted
        );
        assert!(matches!(
            catalog.delete_repository(&repo.id, None, &admin()).unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            catalog.authorize_index(&repo.id, &admin()).unwrap_err(),
            Error::InvalidState(_)
        ));
    }

    #[test]
    fn test_index_requires_admin() {
        let (catalog, _) = catalog();
        let repo = catalog.create_repository(&request("stable"), &admin()).unwrap();
        assert!(matches!(
            catalog.authorize_index(&repo.id, &alice()).unwrap_err(),
            Error::Unauthorized(_)
        ));
        assert_eq!(catalog.authorize_index(&repo.id, &admin()).unwrap().id, repo.id);
    }
}

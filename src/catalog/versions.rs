use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use uuid::Uuid;

use super::validation::validate_version;
use super::{Catalog, non_empty, require_template_roles, resolve_stamp};
use crate::error::{Error, Result};
use crate::package;
use crate::types::{
    Actor, AppTemplate, AppVersion, Attachment, AuditRecord, PackageRef, Role, TemplateStatus,
    VersionAction, VersionStatus, timestamp_now,
};
use crate::workflow::{TransitionRequest, Transitioned};

const PACKAGE_CONTENT_TYPE: &str = "application/gzip";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateVersion {
    /// Falls back to the chart version of `package`.
    pub version: Option<String>,
    pub description: Option<String>,
    pub package: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionPatch {
    pub description: Option<String>,
    pub package: Option<Vec<u8>>,
}

/// Package bytes together with a download file name.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageDownload {
    pub file_name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub(super) struct StagedPackage {
    pub attachment: Attachment,
    pub version: String,
    pub description: Option<String>,
    pub chart_name: Option<String>,
}

/// Result of a dry-run version create: what the package would become.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageCheck {
    pub name: Option<String>,
    pub version: String,
    pub description: Option<String>,
    pub app_version: Option<String>,
}

/// Reads the chart metadata and settles the version an upload would get.
fn examine_package(data: &[u8], version_override: Option<&str>) -> Result<PackageCheck> {
    let info = package::inspect(data)?;
    let version = non_empty(version_override)
        .or_else(|| info.as_ref().map(|i| i.version.clone()))
        .ok_or_else(|| Error::validation("package has no Chart.yaml and no version was given"))?;
    validate_version(&version)?;
    let (name, description, app_version) = match info {
        Some(info) => (Some(info.name), info.description, info.app_version),
        None => (None, None, None),
    };
    Ok(PackageCheck {
        name,
        version,
        description,
        app_version,
    })
}

impl Catalog {
    /// Validates an uploaded archive and stores it as an attachment.
    pub(super) async fn stage_package(
        &self,
        data: &[u8],
        version_override: Option<&str>,
    ) -> Result<StagedPackage> {
        let PackageCheck {
            name: chart_name,
            version,
            description,
            ..
        } = examine_package(data, version_override)?;

        let file_name = format!(
            "{}-{version}.tgz",
            chart_name.as_deref().unwrap_or("package")
        );
        let attachment = self
            .attachments
            .put(&file_name, Some(PACKAGE_CONTENT_TYPE), data)
            .await?;

        Ok(StagedPackage {
            attachment,
            version,
            description,
            chart_name,
        })
    }

    /// Loads a template that the actor may add uploaded versions to.
    fn uploadable_template(&self, template_id: &str, actor: &Actor) -> Result<AppTemplate> {
        let template = self.template(template_id)?;
        require_template_roles(actor, &template, Role::OWNER.union(Role::ADMIN), "add versions to this app")?;
        if template.status == TemplateStatus::Deleted {
            return Err(Error::invalid_state(format!("app template {template_id} is deleted")));
        }
        if template.repository_id.is_some() {
            return Err(Error::invalid_state(format!(
                "versions of {} come from its repository",
                template.name
            )));
        }
        Ok(template)
    }

    /// Runs every check of [`Catalog::create_version`] without storing
    /// anything.
    pub fn check_version_upload(
        &self,
        template_id: &str,
        request: &CreateVersion,
        actor: &Actor,
    ) -> Result<PackageCheck> {
        let template = self.uploadable_template(template_id, actor)?;
        let check = examine_package(&request.package, request.version.as_deref())?;
        let taken = self
            .store
            .list_template_versions(&template.id)?
            .into_iter()
            .any(|v| v.version == check.version && v.status != VersionStatus::Deleted);
        if taken {
            return Err(Error::AlreadyExists(format!(
                "app version {} of {}",
                check.version, template.name
            )));
        }
        Ok(check)
    }

    /// Adds a draft version to an uploaded template.
    pub async fn create_version(
        &self,
        template_id: &str,
        request: &CreateVersion,
        actor: &Actor,
    ) -> Result<AppVersion> {
        let template = self.uploadable_template(template_id, actor)?;

        let staged = self
            .stage_package(&request.package, request.version.as_deref())
            .await?;
        let now = timestamp_now();
        let version = AppVersion {
            id: Uuid::new_v4().to_string(),
            app_template_id: template.id.clone(),
            version: staged.version.clone(),
            description: request
                .description
                .clone()
                .or_else(|| staged.description.clone()),
            package_ref: PackageRef::Attachment(staged.attachment.id.clone()),
            owner: actor.name.clone(),
            status: VersionStatus::Draft,
            created_at: now,
            updated_at: now,
            stamp: 1,
        };

        if let Err(e) = self.store.create_version(&version) {
            self.discard(Some(&staged)).await;
            return Err(e);
        }
        tracing::info!(
            id = %version.id,
            app = %template.name,
            version = %version.version,
            owner = %version.owner,
            "app version created"
        );
        Ok(version)
    }

    pub fn describe_version(&self, id: &str) -> Result<AppVersion> {
        self.version(id)
    }

    /// Changes the description or package of a version that is still mutable.
    pub async fn patch_version(
        &self,
        id: &str,
        patch: &VersionPatch,
        expected_stamp: Option<i64>,
        actor: &Actor,
    ) -> Result<AppVersion> {
        let current = self.version(id)?;
        let template = self.template(&current.app_template_id)?;
        require_template_roles(actor, &template, Role::OWNER.union(Role::ADMIN), "modify this version")?;
        let stamp = resolve_stamp(current.stamp, expected_stamp, "app version")?;
        if current.status.is_content_frozen() {
            return Err(Error::invalid_state(format!(
                "app version {} is {} and can no longer change",
                current.version, current.status
            )));
        }

        let mut next = current.clone();
        if let Some(description) = &patch.description {
            next.description = Some(description.clone());
        }
        let staged = match &patch.package {
            Some(data) => {
                let staged = self.stage_package(data, Some(&current.version)).await?;
                next.package_ref = PackageRef::Attachment(staged.attachment.id.clone());
                Some(staged)
            }
            None => None,
        };

        let updated = match self.store.update_version(&next, stamp) {
            Ok(updated) => updated,
            Err(e) => {
                self.discard(staged.as_ref()).await;
                return Err(e);
            }
        };

        if staged.is_some() {
            if let PackageRef::Attachment(old) = &current.package_ref {
                let outcome = self.attachments.delete_many(&[old.clone()]).await;
                tracing::debug!(?outcome, "replaced package removed");
            }
        }
        tracing::info!(id, version = %updated.version, stamp = updated.stamp, "app version updated");
        Ok(updated)
    }

    /// Moves the version along the review workflow.
    pub fn version_action(&self, id: &str, request: &TransitionRequest) -> Result<Transitioned> {
        self.workflow.transition(id, request)
    }

    pub fn delete_version(&self, id: &str, expected_stamp: Option<i64>, actor: &Actor) -> Result<Transitioned> {
        let mut request = TransitionRequest::new(VersionAction::Delete, actor.clone());
        request.expected_stamp = expected_stamp;
        self.workflow.transition(id, &request)
    }

    pub fn list_version_audits(&self, id: &str) -> Result<Vec<AuditRecord>> {
        self.workflow.list_version_audits(id)
    }

    /// Returns the package archive of a version, fetching it from the
    /// upstream repository when it was indexed.
    pub async fn get_version_package(&self, id: &str) -> Result<PackageDownload> {
        let version = self.version(id)?;
        let template = self.template(&version.app_template_id)?;
        let file_name = format!("{}-{}.tgz", template.name, version.version);

        let data = match &version.package_ref {
            PackageRef::Attachment(attachment_id) => self.attachments.get(attachment_id).await?.0,
            PackageRef::Remote(url) => {
                let repository_id = template.repository_id.as_deref().ok_or_else(|| {
                    Error::Internal(format!("app version {id} has a remote package but no repository"))
                })?;
                let repo = self
                    .store
                    .get_repository(repository_id)?
                    .ok_or_else(|| Error::not_found(format!("repository {repository_id}")))?;
                self.fetcher.fetch_package(&repo, url).await?
            }
        };

        Ok(PackageDownload { file_name, data })
    }

    /// Files of the version's package keyed by path, base64 encoded.
    pub async fn get_version_files(&self, id: &str) -> Result<BTreeMap<String, String>> {
        let download = self.get_version_package(id).await?;
        let files = package::read_files(&download.data)?;
        Ok(files
            .into_iter()
            .map(|(path, contents)| (path, STANDARD.encode(contents)))
            .collect())
    }
}

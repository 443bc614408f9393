use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::validation::validate_template_name;
use super::versions::StagedPackage;
use super::{Catalog, non_empty, require_roles, require_template_roles, resolve_stamp};
use crate::error::{Error, Result};
use crate::types::{
    Actor, AppTemplate, AppVersion, Condition, ListQuery, Page, PackageRef, Role, TemplateAction,
    TemplateStatus, VersionStatus, timestamp_now,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateTemplate {
    /// Falls back to the chart name of `package`.
    pub name: Option<String>,
    pub description: Option<String>,
    pub workspace: String,
    pub category_id: Option<String>,
    /// Initial version archive, entered as a draft.
    pub package: Option<Vec<u8>>,
    /// Falls back to the chart version of `package`.
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplatePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// An empty string removes the category.
    #[serde(default)]
    pub category_id: Option<String>,
}

impl Catalog {
    fn check_category(&self, category_id: Option<&str>) -> Result<()> {
        if let Some(id) = category_id {
            if self.store.get_category(id)?.is_none() {
                return Err(Error::validation(format!("category {id} does not exist")));
            }
        }
        Ok(())
    }

    /// Creates an uploaded template, optionally with its first draft version.
    pub async fn create_template(
        &self,
        request: &CreateTemplate,
        actor: &Actor,
    ) -> Result<(AppTemplate, Option<AppVersion>)> {
        let workspace = non_empty(Some(&request.workspace))
            .ok_or_else(|| Error::validation("workspace cannot be empty"))?;
        let category_id = non_empty(request.category_id.as_deref());
        self.check_category(category_id.as_deref())?;

        let staged = match &request.package {
            Some(data) => Some(self.stage_package(data, request.version.as_deref()).await?),
            None => None,
        };

        let name = non_empty(request.name.as_deref())
            .or_else(|| staged.as_ref().and_then(|s| s.chart_name.clone()))
            .ok_or_else(|| Error::validation("app name cannot be empty"))
            .and_then(|name| validate_template_name(&name).map(|()| name));
        let name = match name {
            Ok(name) => name,
            Err(e) => {
                self.discard(staged.as_ref()).await;
                return Err(e);
            }
        };

        let now = timestamp_now();
        let template = AppTemplate {
            id: Uuid::new_v4().to_string(),
            repository_id: None,
            workspace: Some(workspace),
            name,
            description: request.description.clone(),
            owner: actor.name.clone(),
            category_id,
            status: TemplateStatus::Active,
            suspended_by: None,
            created_at: now,
            updated_at: now,
            stamp: 1,
        };
        let version = staged.as_ref().map(|s| AppVersion {
            id: Uuid::new_v4().to_string(),
            app_template_id: template.id.clone(),
            version: s.version.clone(),
            description: s.description.clone(),
            package_ref: PackageRef::Attachment(s.attachment.id.clone()),
            owner: actor.name.clone(),
            status: VersionStatus::Draft,
            created_at: now,
            updated_at: now,
            stamp: 1,
        });

        if let Err(e) = self.store.create_template(&template, version.as_ref()) {
            self.discard(staged.as_ref()).await;
            return Err(e);
        }

        tracing::info!(
            id = %template.id,
            name = %template.name,
            owner = %template.owner,
            version = version.as_ref().map(|v| v.version.as_str()),
            "app template created"
        );
        Ok((template, version))
    }

    pub fn describe_template(&self, id: &str) -> Result<AppTemplate> {
        self.template(id)
    }

    pub fn list_templates(&self, query: &ListQuery) -> Result<Page<AppTemplate>> {
        self.store.list_templates(query)
    }

    pub fn list_template_versions(&self, template_id: &str, query: &ListQuery) -> Result<Page<AppVersion>> {
        self.template(template_id)?;
        let query = query
            .clone()
            .with_condition(Condition::exact("app_template_id", template_id));
        self.store.list_versions(&query)
    }

    pub fn patch_template(
        &self,
        id: &str,
        patch: &TemplatePatch,
        expected_stamp: Option<i64>,
        actor: &Actor,
    ) -> Result<AppTemplate> {
        let current = self.template(id)?;
        require_template_roles(actor, &current, Role::OWNER.union(Role::ADMIN), "modify this app")?;
        if current.status == TemplateStatus::Deleted {
            return Err(Error::invalid_state(format!("app template {id} is deleted")));
        }
        let stamp = resolve_stamp(current.stamp, expected_stamp, "app template")?;

        let mut next = current.clone();
        if let Some(name) = &patch.name {
            validate_template_name(name.trim())?;
            next.name = name.trim().to_string();
        }
        if let Some(description) = &patch.description {
            next.description = Some(description.clone());
        }
        if let Some(category_id) = &patch.category_id {
            next.category_id = non_empty(Some(category_id));
            self.check_category(next.category_id.as_deref())?;
        }

        let updated = self.store.update_template(&next, stamp)?;
        tracing::info!(id, name = %updated.name, stamp = updated.stamp, "app template updated");
        Ok(updated)
    }

    /// Soft-deletes the template and its versions.
    pub fn delete_template(&self, id: &str, expected_stamp: Option<i64>, actor: &Actor) -> Result<()> {
        let current = self.template(id)?;
        require_template_roles(actor, &current, Role::OWNER.union(Role::ADMIN), "delete this app")?;
        if current.status == TemplateStatus::Deleted {
            return Err(Error::not_found(format!("app template {id}")));
        }
        let stamp = resolve_stamp(current.stamp, expected_stamp, "app template")?;

        self.store
            .delete_template(id, stamp, &actor.name)
            .inspect_err(|e| tracing::warn!(id, error = %e, "app template delete refused"))?;
        tracing::info!(id, name = %current.name, actor = %actor.name, "app template deleted");
        Ok(())
    }

    /// Suspends or recovers a whole template. Versions keep their status; a
    /// suspended template blocks new applications.
    pub fn template_action(&self, id: &str, action: TemplateAction, actor: &Actor) -> Result<AppTemplate> {
        require_roles(actor, Role::REVIEWER, &format!("{action} apps"))?;
        let current = self.template(id)?;

        let mut next = current.clone();
        match (current.status, action) {
            (TemplateStatus::Active, TemplateAction::Suspend) => {
                next.status = TemplateStatus::Suspended;
                next.suspended_by = Some(actor.name.clone());
            }
            (TemplateStatus::Suspended, TemplateAction::Recover) => {
                next.status = TemplateStatus::Active;
                next.suspended_by = None;
            }
            (status, action) => {
                return Err(Error::invalid_state(format!(
                    "cannot {action} an app template in status {status}"
                )));
            }
        }

        let updated = self.store.update_template(&next, current.stamp)?;
        tracing::info!(id, %action, actor = %actor.name, "app template {}", updated.status);
        Ok(updated)
    }

    pub(super) async fn discard(&self, staged: Option<&StagedPackage>) {
        if let Some(staged) = staged {
            let outcome = self.attachments.delete_many(&[staged.attachment.id.clone()]).await;
            tracing::debug!(?outcome, "discarded staged package");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{admin, alice, catalog};
    use crate::package::tests::tarball;

    fn chart(version: &str) -> Vec<u8> {
        tarball(&[
            ("nginx/Chart.yaml", &format!("name: nginx\nversion: {version}\ndescription: web server\n")),
            ("nginx/values.yaml", "replicas: 1\n"),
        ])
    }

    #[tokio::test]
    async fn test_create_with_package_uses_chart_metadata() {
        let (catalog, _) = catalog();
        let request = CreateTemplate {
            workspace: "ws1".into(),
            package: Some(chart("1.0.0")),
            ..Default::default()
        };
        let (template, version) = catalog.create_template(&request, &alice()).await.unwrap();
        let version = version.unwrap();

        assert_eq!(template.name, "nginx");
        assert_eq!(template.owner, "alice");
        assert_eq!(version.version, "1.0.0");
        assert_eq!(version.status, VersionStatus::Draft);
        assert_eq!(version.description.as_deref(), Some("web server"));
        assert!(matches!(version.package_ref, PackageRef::Attachment(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_garbage_package() {
        let (catalog, _) = catalog();
        let request = CreateTemplate {
            name: Some("nginx".into()),
            workspace: "ws1".into(),
            package: Some(b"not a tarball".to_vec()),
            ..Default::default()
        };
        let err = catalog.create_template(&request, &alice()).await.unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_patch_requires_owner() {
        let (catalog, _) = catalog();
        let request = CreateTemplate {
            name: Some("nginx".into()),
            workspace: "ws1".into(),
            ..Default::default()
        };
        let (template, _) = catalog.create_template(&request, &alice()).await.unwrap();

        let patch = TemplatePatch {
            description: Some("reverse proxy".into()),
            ..Default::default()
        };
        let mallory = Actor::new("mallory", Role::default());
        assert!(matches!(
            catalog.patch_template(&template.id, &patch, None, &mallory).unwrap_err(),
            Error::Unauthorized(_)
        ));
        let updated = catalog.patch_template(&template.id, &patch, None, &alice()).unwrap();
        assert_eq!(updated.description.as_deref(), Some("reverse proxy"));

        let bad_category = TemplatePatch {
            category_id: Some("nope".into()),
            ..Default::default()
        };
        assert!(matches!(
            catalog.patch_template(&template.id, &bad_category, None, &alice()).unwrap_err(),
            Error::ValidationFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_suspend_and_recover_template() {
        let (catalog, _) = catalog();
        let request = CreateTemplate {
            name: Some("nginx".into()),
            workspace: "ws1".into(),
            ..Default::default()
        };
        let (template, _) = catalog.create_template(&request, &alice()).await.unwrap();

        assert!(matches!(
            catalog
                .template_action(&template.id, TemplateAction::Suspend, &alice())
                .unwrap_err(),
            Error::Unauthorized(_)
        ));
        let suspended = catalog
            .template_action(&template.id, TemplateAction::Suspend, &admin())
            .unwrap();
        assert_eq!(suspended.status, TemplateStatus::Suspended);
        assert_eq!(suspended.suspended_by.as_deref(), Some("root"));
        assert!(matches!(
            catalog
                .template_action(&template.id, TemplateAction::Suspend, &admin())
                .unwrap_err(),
            Error::InvalidState(_)
        ));

        let recovered = catalog
            .template_action(&template.id, TemplateAction::Recover, &admin())
            .unwrap();
        assert_eq!(recovered.status, TemplateStatus::Active);
        assert_eq!(recovered.suspended_by, None);
    }

    #[tokio::test]
    async fn test_delete_marks_versions_deleted() {
        let (catalog, store) = catalog();
        let request = CreateTemplate {
            workspace: "ws1".into(),
            package: Some(chart("1.0.0")),
            ..Default::default()
        };
        let (template, version) = catalog.create_template(&request, &alice()).await.unwrap();
        catalog.delete_template(&template.id, None, &alice()).unwrap();

        let version = store.get_version(&version.unwrap().id).unwrap().unwrap();
        assert_eq!(version.status, VersionStatus::Deleted);
        assert_eq!(store.list_audits(&version.id).unwrap().len(), 1);
        assert_eq!(catalog.list_templates(&ListQuery::new()).unwrap().total, 0);
    }
}

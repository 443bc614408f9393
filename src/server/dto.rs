use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::catalog::{CreateTemplate, CreateVersion, VersionPatch};
use crate::error::Result;
use crate::indexer::JobHandle;
use crate::types::{ListQuery, TemplateAction, VersionAction};

use super::response::ApiError;

/// Query string accepted by every list route.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListParams {
    pub conditions: Option<String>,
    pub paging: Option<String>,
    pub limit: Option<u32>,
    pub page: Option<u32>,
    #[serde(rename = "orderBy")]
    pub order_by: Option<String>,
    pub reverse: Option<bool>,
}

impl ListParams {
    /// Separate `limit`/`page` parameters win over the `paging` pair.
    pub fn into_query(self) -> Result<ListQuery> {
        let conditions = match self.conditions.as_deref() {
            Some(raw) => ListQuery::parse_conditions(raw)?,
            None => Vec::new(),
        };
        let (limit, page) = match self.paging.as_deref() {
            Some(raw) => ListQuery::parse_paging(raw)?,
            None => (crate::types::DEFAULT_LIMIT, crate::types::DEFAULT_PAGE),
        };

        let mut query = ListQuery {
            conditions,
            limit: self.limit.unwrap_or(limit),
            page: self.page.unwrap_or(page),
            ..ListQuery::default()
        };
        if let Some(order_by) = self.order_by.filter(|o| !o.trim().is_empty()) {
            query = query.ordered_by(order_by.trim(), self.reverse.unwrap_or(false));
        }
        Ok(query)
    }
}

/// `?validate` turns a create into a dry run that stores nothing.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ValidateParams {
    pub validate: Option<String>,
}

impl ValidateParams {
    /// Bare `?validate` counts as set; only `false` and `0` opt out.
    pub fn dry_run(&self) -> bool {
        self.validate
            .as_deref()
            .is_some_and(|v| !matches!(v.trim(), "false" | "0"))
    }
}

fn decode_package(encoded: &str) -> std::result::Result<Vec<u8>, ApiError> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| ApiError::bad_request(format!("package is not valid base64: {e}")))
}

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Ignored on workspace routes, which take the workspace from the path.
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    /// Base64 encoded package archive.
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl CreateTemplateRequest {
    pub fn into_request(
        self,
        workspace: Option<String>,
    ) -> std::result::Result<CreateTemplate, ApiError> {
        let package = self.package.as_deref().map(decode_package).transpose()?;
        Ok(CreateTemplate {
            name: self.name,
            description: self.description,
            workspace: workspace.or(self.workspace).unwrap_or_default(),
            category_id: self.category_id,
            package,
            version: self.version,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateVersionRequest {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub package: String,
}

impl CreateVersionRequest {
    pub fn into_request(self) -> std::result::Result<CreateVersion, ApiError> {
        Ok(CreateVersion {
            version: self.version,
            description: self.description,
            package: decode_package(&self.package)?,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PatchVersionRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub package: Option<String>,
}

impl PatchVersionRequest {
    pub fn into_patch(self) -> std::result::Result<VersionPatch, ApiError> {
        Ok(VersionPatch {
            description: self.description,
            package: self.package.as_deref().map(decode_package).transpose()?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct VersionActionRequest {
    pub action: VersionAction,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TemplateActionRequest {
    pub action: TemplateAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoAction {
    Index,
    Cancel,
}

#[derive(Debug, Deserialize)]
pub struct RepoActionRequest {
    pub action: RepoAction,
}

#[derive(Debug, Deserialize)]
pub struct UpgradeRequest {
    pub version_id: String,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: String,
    pub repository_id: String,
    /// True when the request joined a job that was already running.
    pub coalesced: bool,
}

impl From<&JobHandle> for JobResponse {
    fn from(handle: &JobHandle) -> Self {
        Self {
            job_id: handle.job_id().to_string(),
            repository_id: handle.repository_id().to_string(),
            coalesced: handle.coalesced(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub repository_id: String,
    pub cancelled: bool,
}

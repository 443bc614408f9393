use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use super::status::{
    ApplicationStatus, RepoEventKind, RepoScope, RepoStatus, TemplateStatus, VersionAction,
    VersionStatus,
};

/// Current time truncated to the microsecond precision the store keeps.
#[must_use]
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    pub scope: RepoScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_period_secs: Option<i64>,
    pub status: RepoStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stamp: i64,
}

impl Repository {
    /// Packages from global repositories are trusted and skip review.
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        self.scope == RepoScope::Global
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppTemplate {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    pub status: TemplateStatus,
    /// Who suspended the template; cleared when it becomes active again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stamp: i64,
}

/// Where the package archive of a version lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum PackageRef {
    /// Uploaded archive held in the attachment store.
    Attachment(String),
    /// Archive served by the upstream repository.
    Remote(String),
}

const ATTACHMENT_PREFIX: &str = "attachment:";

impl PackageRef {
    pub fn parse(s: &str) -> Option<PackageRef> {
        if let Some(id) = s.strip_prefix(ATTACHMENT_PREFIX) {
            if id.is_empty() {
                return None;
            }
            return Some(PackageRef::Attachment(id.to_string()));
        }
        if s.is_empty() {
            return None;
        }
        Some(PackageRef::Remote(s.to_string()))
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageRef::Attachment(id) => write!(f, "{ATTACHMENT_PREFIX}{id}"),
            PackageRef::Remote(url) => f.write_str(url),
        }
    }
}

impl From<PackageRef> for String {
    fn from(r: PackageRef) -> Self {
        r.to_string()
    }
}

impl TryFrom<String> for PackageRef {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        PackageRef::parse(&s).ok_or_else(|| format!("invalid package reference '{s}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppVersion {
    pub id: String,
    pub app_template_id: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub package_ref: PackageRef,
    pub owner: String,
    pub status: VersionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: i64,
    pub version_id: String,
    pub from_status: VersionStatus,
    pub to_status: VersionStatus,
    pub action: VersionAction,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoEvent {
    pub seq: i64,
    pub repository_id: String,
    pub job_id: String,
    pub kind: RepoEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub app_template_id: String,
    pub app_version_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_version_id: Option<String>,
    pub workspace: String,
    pub cluster: String,
    pub namespace: String,
    pub status: ApplicationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conclusion_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conf: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationBinding {
    pub application_id: String,
    pub seq: i64,
    pub app_version_id: String,
    pub bound_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub size: i64,
    pub digest: String,
    pub created_at: DateTime<Utc>,
}

/// Reviewer-facing view of one submit/pass/reject audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub version_id: String,
    pub app_template_id: String,
    pub app_name: String,
    pub version: String,
    pub status: VersionStatus,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexLease {
    pub repository_id: String,
    pub job_id: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_ref_parse() {
        assert_eq!(
            PackageRef::parse("attachment:abc"),
            Some(PackageRef::Attachment("abc".into()))
        );
        assert_eq!(
            PackageRef::parse("https://charts.example.com/foo-1.0.0.tgz"),
            Some(PackageRef::Remote(
                "https://charts.example.com/foo-1.0.0.tgz".into()
            ))
        );
        assert_eq!(PackageRef::parse("attachment:"), None);
        assert_eq!(PackageRef::parse(""), None);
    }

    #[test]
    fn test_package_ref_serializes_as_string() {
        let json = serde_json::to_string(&PackageRef::Attachment("a1".into())).unwrap();
        assert_eq!(json, "\"attachment:a1\"");
    }
}

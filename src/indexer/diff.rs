//! Turns manifest pages into catalog change sets.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::fetch::resolve_url;
use super::manifest::{Manifest, ManifestEntry};
use crate::store::{CatalogChange, VersionTransition};
use crate::types::{
    AppTemplate, AppVersion, PackageRef, Repository, TemplateStatus, VersionAction, VersionStatus,
    timestamp_now,
};

pub const INDEXER_ACTOR: &str = "system:indexer";
const ABSENT_MESSAGE: &str = "absent from repository index";
const REAPPEARED_MESSAGE: &str = "reappeared in repository index";

/// Catalog state of one repository as the indexer sees it.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub templates: Vec<AppTemplate>,
    pub versions: HashMap<String, Vec<AppVersion>>,
    /// Suspended versions whose latest audit record was written by the indexer.
    pub indexer_suspended: BTreeSet<String>,
}

impl Snapshot {
    /// The live template with this name, or a deleted one when no live one exists.
    fn template_named(&self, name: &str) -> Option<&AppTemplate> {
        let mut deleted = None;
        for t in self.templates.iter().filter(|t| t.name == name) {
            if t.status != TemplateStatus::Deleted {
                return Some(t);
            }
            deleted = Some(t);
        }
        deleted
    }

    fn versions_of(&self, template_id: &str) -> &[AppVersion] {
        self.versions
            .get(template_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn version_named<'a>(&'a self, template_id: &str, version: &str) -> Option<&'a AppVersion> {
        let mut deleted = None;
        for v in self.versions_of(template_id).iter().filter(|v| v.version == version) {
            if v.status != VersionStatus::Deleted {
                return Some(v);
            }
            deleted = Some(v);
        }
        deleted
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub templates_created: u32,
    pub templates_reactivated: u32,
    pub templates_suspended: u32,
    pub versions_created: u32,
    pub versions_updated: u32,
    pub versions_recovered: u32,
    pub versions_suspended: u32,
    pub entries_skipped: u32,
}

impl DiffStats {
    pub fn add(&mut self, other: &DiffStats) {
        self.templates_created += other.templates_created;
        self.templates_reactivated += other.templates_reactivated;
        self.templates_suspended += other.templates_suspended;
        self.versions_created += other.versions_created;
        self.versions_updated += other.versions_updated;
        self.versions_recovered += other.versions_recovered;
        self.versions_suspended += other.versions_suspended;
        self.entries_skipped += other.entries_skipped;
    }
}

#[derive(Debug, Default)]
pub struct Plan {
    pub changes: Vec<CatalogChange>,
    pub stats: DiffStats,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Owner recorded on templates the indexer creates.
fn indexed_owner(repo: &Repository) -> String {
    repo.workspace.clone().unwrap_or_else(|| "system".to_string())
}

fn initial_status(repo: &Repository) -> VersionStatus {
    if repo.is_trusted() {
        VersionStatus::Active
    } else {
        VersionStatus::Draft
    }
}

fn indexer_transition(from: VersionStatus, action: VersionAction, message: &str) -> Option<VersionTransition> {
    let to = crate::workflow::next_status(from, action)?;
    Some(VersionTransition {
        from,
        to,
        action,
        actor: INDEXER_ACTOR.to_string(),
        message: Some(message.to_string()),
    })
}

fn new_version(
    repo: &Repository,
    template_id: &str,
    owner: &str,
    page_url: &str,
    entry: &ManifestEntry,
) -> Option<AppVersion> {
    let url = entry.package_url()?;
    let now = timestamp_now();
    Some(AppVersion {
        id: Uuid::new_v4().to_string(),
        app_template_id: template_id.to_string(),
        version: entry.version.clone(),
        description: entry.description.clone(),
        package_ref: PackageRef::Remote(resolve_url(page_url, url)),
        owner: owner.to_string(),
        status: initial_status(repo),
        created_at: now,
        updated_at: now,
        stamp: 1,
    })
}

/// Plans the writes for one manifest page. Entries already reflected in the
/// catalog produce no changes.
pub fn plan_page(repo: &Repository, page_url: &str, manifest: &Manifest, snapshot: &Snapshot) -> Plan {
    let mut plan = Plan::default();

    for (name, entries) in &manifest.entries {
        match snapshot.template_named(name) {
            None => plan_new_template(repo, page_url, name, entries, &mut plan),
            Some(t) if t.status == TemplateStatus::Deleted => {
                tracing::debug!(repo = %repo.name, app = %name, "skipping deleted app template");
                plan.stats.entries_skipped += entries.len() as u32;
            }
            Some(t) => plan_existing_template(repo, page_url, t, entries, snapshot, &mut plan),
        }
    }

    plan
}

fn plan_new_template(
    repo: &Repository,
    page_url: &str,
    name: &str,
    entries: &[ManifestEntry],
    plan: &mut Plan,
) {
    let now = timestamp_now();
    let owner = indexed_owner(repo);
    let template = AppTemplate {
        id: Uuid::new_v4().to_string(),
        repository_id: Some(repo.id.clone()),
        workspace: repo.workspace.clone(),
        name: name.to_string(),
        description: entries.first().and_then(|e| e.description.clone()),
        owner: owner.clone(),
        category_id: None,
        status: TemplateStatus::Active,
        suspended_by: None,
        created_at: now,
        updated_at: now,
        stamp: 1,
    };

    let versions: Vec<AppVersion> = entries
        .iter()
        .filter_map(|e| new_version(repo, &template.id, &owner, page_url, e))
        .collect();

    plan.stats.templates_created += 1;
    plan.stats.versions_created += versions.len() as u32;
    plan.changes.push(CatalogChange::InsertTemplate(template));
    plan.changes
        .extend(versions.into_iter().map(CatalogChange::InsertVersion));
}

fn plan_existing_template(
    repo: &Repository,
    page_url: &str,
    template: &AppTemplate,
    entries: &[ManifestEntry],
    snapshot: &Snapshot,
    plan: &mut Plan,
) {
    if template.status == TemplateStatus::Suspended
        && template.suspended_by.as_deref() == Some(INDEXER_ACTOR)
    {
        plan.stats.templates_reactivated += 1;
        plan.changes.push(CatalogChange::SetTemplateStatus {
            template_id: template.id.clone(),
            expected_stamp: template.stamp,
            status: TemplateStatus::Active,
            actor: INDEXER_ACTOR.to_string(),
        });
    }

    for entry in entries {
        let Some(existing) = snapshot.version_named(&template.id, &entry.version) else {
            if let Some(version) = new_version(repo, &template.id, &template.owner, page_url, entry) {
                plan.stats.versions_created += 1;
                plan.changes.push(CatalogChange::InsertVersion(version));
            }
            continue;
        };

        match existing.status {
            VersionStatus::Deleted => {
                plan.stats.entries_skipped += 1;
            }
            VersionStatus::Suspended if snapshot.indexer_suspended.contains(&existing.id) => {
                if let Some(transition) =
                    indexer_transition(existing.status, VersionAction::Recover, REAPPEARED_MESSAGE)
                {
                    plan.stats.versions_recovered += 1;
                    plan.changes.push(CatalogChange::TransitionVersion {
                        version_id: existing.id.clone(),
                        expected_stamp: existing.stamp,
                        transition,
                    });
                }
            }
            status => {
                let url = entry.package_url().map(|u| resolve_url(page_url, u));
                let new_ref = url.map(PackageRef::Remote);
                let changed = new_ref.as_ref().is_some_and(|r| *r != existing.package_ref)
                    || entry.description != existing.description;
                if !changed {
                    continue;
                }
                if status.is_content_frozen() {
                    tracing::debug!(
                        app = %template.name,
                        version = %existing.version,
                        "upstream changed a frozen version, ignoring"
                    );
                    plan.stats.entries_skipped += 1;
                    continue;
                }
                let mut updated = existing.clone();
                if let Some(r) = new_ref {
                    updated.package_ref = r;
                }
                updated.description = entry.description.clone();
                plan.stats.versions_updated += 1;
                plan.changes.push(CatalogChange::UpdateVersionContent {
                    version: updated,
                    expected_stamp: existing.stamp,
                });
            }
        }
    }
}

/// Plans suspensions for everything the completed fetch no longer lists.
pub fn plan_prune(snapshot: &Snapshot, seen: &BTreeMap<String, BTreeSet<String>>) -> Plan {
    let mut plan = Plan::default();

    for template in snapshot
        .templates
        .iter()
        .filter(|t| t.status != TemplateStatus::Deleted)
    {
        let seen_versions = seen.get(&template.name);

        if seen_versions.is_none() && template.status == TemplateStatus::Active {
            plan.stats.templates_suspended += 1;
            plan.changes.push(CatalogChange::SetTemplateStatus {
                template_id: template.id.clone(),
                expected_stamp: template.stamp,
                status: TemplateStatus::Suspended,
                actor: INDEXER_ACTOR.to_string(),
            });
        }

        for version in snapshot.versions_of(&template.id) {
            if version.status != VersionStatus::Active {
                continue;
            }
            if seen_versions.is_some_and(|vs| vs.contains(&version.version)) {
                continue;
            }
            if let Some(transition) =
                indexer_transition(version.status, VersionAction::Suspend, ABSENT_MESSAGE)
            {
                plan.stats.versions_suspended += 1;
                plan.changes.push(CatalogChange::TransitionVersion {
                    version_id: version.id.clone(),
                    expected_stamp: version.stamp,
                    transition,
                });
            }
        }
    }

    plan
}

//! Version review workflow.
//!
//! Moves an [`AppVersion`] along the edges of [`transitions::TRANSITIONS`],
//! checking the caller's roles first and committing the status change together
//! with its [`AuditRecord`].

pub mod transitions;

pub use transitions::{next_status, required_roles};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::{Store, VersionTransition};
use crate::types::{Actor, AppTemplate, AppVersion, AuditRecord, Role, VersionAction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub action: VersionAction,
    pub actor: Actor,
    pub message: Option<String>,
    /// When set, the transition fails with `Conflict` unless the version
    /// still carries this stamp.
    pub expected_stamp: Option<i64>,
}

impl TransitionRequest {
    pub fn new(action: VersionAction, actor: Actor) -> Self {
        Self {
            action,
            actor,
            message: None,
            expected_stamp: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_expected_stamp(mut self, stamp: i64) -> Self {
        self.expected_stamp = Some(stamp);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transitioned {
    pub version: AppVersion,
    pub record: AuditRecord,
}

/// Roles the actor holds for this template, including the implied ones.
#[must_use]
pub fn effective_roles(actor: &Actor, template: &AppTemplate) -> Role {
    let roles = actor.roles.expand_implied();
    if actor.name == template.owner {
        roles.union(Role::OWNER)
    } else {
        roles
    }
}

pub struct WorkflowEngine {
    store: Arc<dyn Store>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn transition(&self, version_id: &str, request: &TransitionRequest) -> Result<Transitioned> {
        let version = self
            .store
            .get_version(version_id)?
            .ok_or_else(|| Error::not_found(format!("app version {version_id}")))?;
        let template = self
            .store
            .get_template(&version.app_template_id)?
            .ok_or_else(|| Error::not_found(format!("app template {}", version.app_template_id)))?;

        let action = request.action;
        let roles = effective_roles(&request.actor, &template);
        if !roles.intersects(required_roles(action)) {
            tracing::warn!(
                version_id,
                actor = %request.actor.name,
                %action,
                "workflow transition denied"
            );
            return Err(Error::Unauthorized(format!(
                "{} may not {action} version {}",
                request.actor.name, version.version
            )));
        }

        if let Some(expected) = request.expected_stamp {
            if expected != version.stamp {
                tracing::warn!(version_id, expected, actual = version.stamp, "stale stamp");
                return Err(Error::conflict(format!(
                    "app version {version_id} is at stamp {}, not {expected}",
                    version.stamp
                )));
            }
        }

        let Some(to) = next_status(version.status, action) else {
            tracing::warn!(
                version_id,
                status = %version.status,
                %action,
                "workflow transition rejected"
            );
            return Err(Error::invalid_state(format!(
                "cannot {action} a version in status {}",
                version.status
            )));
        };

        let transition = VersionTransition {
            from: version.status,
            to,
            action,
            actor: request.actor.name.clone(),
            message: request.message.clone(),
        };

        let (version, record) = self
            .store
            .transition_version(version_id, version.stamp, &transition)
            .inspect_err(|e| {
                tracing::warn!(version_id, %action, error = %e, "workflow transition aborted");
            })?;

        tracing::info!(
            version_id,
            app = %template.name,
            version = %version.version,
            from = %record.from_status,
            to = %record.to_status,
            actor = %record.actor,
            "version transitioned"
        );

        Ok(Transitioned { version, record })
    }

    pub fn list_version_audits(&self, version_id: &str) -> Result<Vec<AuditRecord>> {
        if self.store.get_version(version_id)?.is_none() {
            return Err(Error::not_found(format!("app version {version_id}")));
        }
        self.store.list_audits(version_id)
    }

    pub fn list_template_audits(&self, template_id: &str) -> Result<Vec<AuditRecord>> {
        if self.store.get_template(template_id)?.is_none() {
            return Err(Error::not_found(format!("app template {template_id}")));
        }
        self.store.list_template_audits(template_id)
    }
}

//! Release manager.
//!
//! Applications are bound to one [`AppVersion`] at a time. Every operation
//! writes the new status first and then hands an intent to the
//! [`Orchestrator`]; outcomes flow back through [`ReleaseManager::reconcile`].

pub mod orchestrator;
pub mod reconcile;

pub use orchestrator::{
    ChannelOrchestrator, IntentKind, LoggingOrchestrator, Orchestrator, OrchestratorReport,
    ReleaseIntent, ReportOutcome,
};
pub use reconcile::Reconciler;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{
    Application, ApplicationBinding, ApplicationStatus, AppVersion, Condition, ListQuery, Page,
    TemplateStatus, VersionStatus, timestamp_now,
};

/// Reports that lose a stamp race are re-read and re-applied this often.
const RECONCILE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateApplication {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub app_version_id: String,
    pub workspace: String,
    pub cluster: String,
    pub namespace: String,
    #[serde(default)]
    pub conf: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub conf: Option<String>,
}

/// Narrows an application list to a workspace, cluster or namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationScope {
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum ReconcileOutcome {
    Applied { application: Application },
    /// The report did not match the application's current status.
    Ignored { status: ApplicationStatus },
}

fn require_name(name: &str, what: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::validation(format!("{what} must not be empty")));
    }
    Ok(())
}

fn check_expected(app: &Application, expected_stamp: Option<i64>) -> Result<()> {
    match expected_stamp {
        Some(expected) if expected != app.stamp => Err(Error::conflict(format!(
            "application {} is at stamp {}, not {expected}",
            app.id, app.stamp
        ))),
        _ => Ok(()),
    }
}

pub struct ReleaseManager {
    store: Arc<dyn Store>,
    orchestrator: Arc<dyn Orchestrator>,
}

impl ReleaseManager {
    pub fn new(store: Arc<dyn Store>, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    fn load(&self, id: &str) -> Result<Application> {
        self.store
            .get_application(id)?
            .ok_or_else(|| Error::not_found(format!("application {id}")))
    }

    fn load_version(&self, id: &str) -> Result<AppVersion> {
        self.store
            .get_version(id)?
            .ok_or_else(|| Error::not_found(format!("app version {id}")))
    }

    pub async fn create_application(&self, request: &CreateApplication) -> Result<Application> {
        require_name(&request.name, "application name")?;
        require_name(&request.workspace, "workspace")?;
        require_name(&request.cluster, "cluster")?;
        require_name(&request.namespace, "namespace")?;

        let version = self.load_version(&request.app_version_id)?;
        if version.status != VersionStatus::Active {
            return Err(Error::NotDeployable(format!(
                "app version {} is {}",
                version.id, version.status
            )));
        }
        let template = self
            .store
            .get_template(&version.app_template_id)?
            .ok_or_else(|| Error::not_found(format!("app template {}", version.app_template_id)))?;
        if template.status != TemplateStatus::Active {
            return Err(Error::NotDeployable(format!(
                "app template {} is {}",
                template.name, template.status
            )));
        }

        let now = timestamp_now();
        let app = Application {
            id: Uuid::new_v4().to_string(),
            name: request.name.trim().to_string(),
            description: request.description.clone(),
            app_template_id: template.id.clone(),
            app_version_id: version.id.clone(),
            pending_version_id: None,
            workspace: request.workspace.clone(),
            cluster: request.cluster.clone(),
            namespace: request.namespace.clone(),
            status: ApplicationStatus::Creating,
            conclusion_ref: None,
            conf: request.conf.clone(),
            created_at: now,
            updated_at: now,
            stamp: 1,
        };
        self.store.create_application(&app)?;

        tracing::info!(
            application_id = %app.id,
            name = %app.name,
            app = %template.name,
            version = %version.version,
            cluster = %app.cluster,
            namespace = %app.namespace,
            "application created"
        );

        let intent = ReleaseIntent::for_application(IntentKind::Install, &app, Some(version.package_ref));
        if let Err(e) = self.orchestrator.submit(intent).await {
            tracing::error!(application_id = %app.id, error = %e, "orchestrator rejected install");
            let mut failed = app.clone();
            failed.status = ApplicationStatus::Failed;
            failed.conclusion_ref = Some(e.to_string());
            self.store.update_application(&failed, app.stamp)?;
            return Err(e);
        }
        Ok(app)
    }

    pub async fn upgrade_application(
        &self,
        id: &str,
        new_version_id: &str,
        expected_stamp: Option<i64>,
    ) -> Result<Application> {
        let app = self.load(id)?;
        check_expected(&app, expected_stamp)?;
        if !matches!(app.status, ApplicationStatus::Active | ApplicationStatus::Failed) {
            return Err(Error::invalid_state(format!(
                "cannot upgrade application {} while {}",
                app.name, app.status
            )));
        }

        let version = self.load_version(new_version_id)?;
        if version.app_template_id != app.app_template_id {
            return Err(Error::validation(format!(
                "app version {new_version_id} belongs to another template"
            )));
        }
        if version.id == app.app_version_id {
            return Err(Error::validation(format!(
                "application {} is already bound to version {}",
                app.name, version.version
            )));
        }
        if version.status != VersionStatus::Active {
            return Err(Error::validation(format!(
                "app version {} is {}, not active",
                version.version, version.status
            )));
        }

        let previous_status = app.status;
        let mut next = app.clone();
        next.status = ApplicationStatus::Upgrading;
        next.pending_version_id = Some(version.id.clone());
        next.conclusion_ref = None;
        let upgrading = self.store.begin_upgrade(&next, app.stamp)?;

        tracing::info!(
            application_id = %app.id,
            from = %app.app_version_id,
            to = %version.id,
            "application upgrade requested"
        );

        let intent =
            ReleaseIntent::for_application(IntentKind::Upgrade, &upgrading, Some(version.package_ref));
        if let Err(e) = self.orchestrator.submit(intent).await {
            tracing::error!(application_id = %app.id, error = %e, "orchestrator rejected upgrade");
            let mut restored = upgrading.clone();
            restored.status = previous_status;
            restored.pending_version_id = None;
            restored.conclusion_ref = Some(e.to_string());
            self.store.update_application(&restored, upgrading.stamp)?;
            return Err(e);
        }
        Ok(upgrading)
    }

    /// Starts uninstalling the application. Succeeds without effect when it
    /// is already deleting or deleted.
    pub async fn delete_application(&self, id: &str) -> Result<()> {
        let app = self.load(id)?;
        if app.status.is_winding_down() {
            tracing::debug!(application_id = id, status = %app.status, "delete is a no-op");
            return Ok(());
        }

        let mut next = app.clone();
        next.status = ApplicationStatus::Deleting;
        next.pending_version_id = None;
        let deleting = self.store.update_application(&next, app.stamp)?;
        tracing::info!(application_id = id, name = %app.name, "application delete requested");

        let intent = ReleaseIntent::for_application(IntentKind::Uninstall, &deleting, None);
        if let Err(e) = self.orchestrator.submit(intent).await {
            tracing::error!(application_id = id, error = %e, "orchestrator rejected uninstall");
            let mut failed = deleting.clone();
            failed.status = ApplicationStatus::Failed;
            failed.conclusion_ref = Some(e.to_string());
            self.store.update_application(&failed, deleting.stamp)?;
            return Err(e);
        }
        Ok(())
    }

    pub fn modify_application(
        &self,
        id: &str,
        patch: &ApplicationPatch,
        expected_stamp: Option<i64>,
    ) -> Result<Application> {
        let app = self.load(id)?;
        check_expected(&app, expected_stamp)?;
        if app.status.is_winding_down() {
            return Err(Error::invalid_state(format!(
                "application {} is {}",
                app.name, app.status
            )));
        }

        let mut next = app.clone();
        if let Some(name) = &patch.name {
            require_name(name, "application name")?;
            next.name = name.trim().to_string();
        }
        if let Some(description) = &patch.description {
            next.description = Some(description.clone());
        }
        if let Some(conf) = &patch.conf {
            next.conf = Some(conf.clone());
        }
        self.store.update_application(&next, app.stamp)
    }

    pub fn describe_application(&self, id: &str) -> Result<Application> {
        self.load(id)
    }

    pub fn list_applications(&self, scope: &ApplicationScope, query: &ListQuery) -> Result<Page<Application>> {
        let mut query = query.clone();
        for (key, value) in [
            ("workspace", &scope.workspace),
            ("cluster", &scope.cluster),
            ("namespace", &scope.namespace),
        ] {
            if let Some(value) = value {
                query = query.with_condition(Condition::exact(key, value.clone()));
            }
        }
        self.store.list_applications(&query)
    }

    pub fn list_bindings(&self, id: &str) -> Result<Vec<ApplicationBinding>> {
        self.load(id)?;
        self.store.list_application_bindings(id)
    }

    /// Applies an orchestrator report. Reports that do not match the
    /// application's transitional status are ignored, so replays are harmless.
    pub fn reconcile(&self, report: &OrchestratorReport) -> Result<ReconcileOutcome> {
        let mut attempt = 1;
        loop {
            let app = self.load(&report.application_id)?;
            match self.apply_report(&app, &report.outcome) {
                Err(Error::Conflict(msg)) if attempt < RECONCILE_ATTEMPTS => {
                    tracing::debug!(application_id = %app.id, attempt, %msg, "report lost a stamp race");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn apply_report(&self, app: &Application, outcome: &ReportOutcome) -> Result<ReconcileOutcome> {
        use ApplicationStatus as S;

        let mut next = app.clone();
        let rebind = match (app.status, outcome) {
            (S::Creating, ReportOutcome::Installed) => {
                next.status = S::Active;
                next.conclusion_ref = None;
                false
            }
            (S::Upgrading, ReportOutcome::Upgraded { version_id })
                if app.pending_version_id.as_deref() == Some(version_id.as_str()) =>
            {
                next.status = S::Active;
                next.app_version_id = version_id.clone();
                next.pending_version_id = None;
                next.conclusion_ref = None;
                true
            }
            (S::Deleting, ReportOutcome::Uninstalled) => {
                next.status = S::Deleted;
                false
            }
            (S::Upgrading, ReportOutcome::Failed { message }) => {
                next.status = S::Active;
                next.pending_version_id = None;
                next.conclusion_ref = Some(message.clone());
                false
            }
            (S::Active, ReportOutcome::Suspended) => {
                next.status = S::Suspended;
                false
            }
            (S::Suspended, ReportOutcome::Resumed) => {
                next.status = S::Active;
                false
            }
            (S::Creating | S::Deleting, ReportOutcome::Failed { message }) => {
                next.status = S::Failed;
                next.conclusion_ref = Some(message.clone());
                false
            }
            (status, outcome) => {
                tracing::debug!(
                    application_id = %app.id,
                    %status,
                    ?outcome,
                    "ignoring orchestrator report"
                );
                return Ok(ReconcileOutcome::Ignored { status });
            }
        };

        let application = if rebind {
            self.store.rebind_application(&next, app.stamp)?
        } else {
            self.store.update_application(&next, app.stamp)?
        };

        match outcome {
            ReportOutcome::Failed { message } => tracing::warn!(
                application_id = %app.id,
                from = %app.status,
                to = %application.status,
                %message,
                "release failed"
            ),
            _ => tracing::info!(
                application_id = %app.id,
                from = %app.status,
                to = %application.status,
                "release reconciled"
            ),
        }
        Ok(ReconcileOutcome::Applied { application })
    }

    /// Asks the orchestrator about every application in a transitional
    /// status and applies what it reports. Returns the number applied.
    pub async fn poll_orchestrator(&self) -> Result<usize> {
        let pending = self.store.list_applications_in_status(&[
            ApplicationStatus::Creating,
            ApplicationStatus::Upgrading,
            ApplicationStatus::Deleting,
        ])?;

        let mut applied = 0;
        for app in pending {
            let report = match self.orchestrator.poll(&app).await {
                Ok(Some(report)) => report,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(application_id = %app.id, error = %e, "orchestrator poll failed");
                    continue;
                }
            };
            match self.reconcile(&report) {
                Ok(ReconcileOutcome::Applied { .. }) => applied += 1,
                Ok(ReconcileOutcome::Ignored { .. }) => {}
                Err(e) => {
                    tracing::warn!(application_id = %app.id, error = %e, "polled report not applied");
                }
            }
        }
        Ok(applied)
    }
}

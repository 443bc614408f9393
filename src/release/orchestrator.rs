//! The seam towards the cluster orchestrator that materializes applications.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::types::{Application, PackageRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Install,
    Upgrade,
    Uninstall,
}

/// What the orchestrator is asked to do for one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseIntent {
    pub kind: IntentKind,
    pub application_id: String,
    pub name: String,
    pub workspace: String,
    pub cluster: String,
    pub namespace: String,
    /// Version to install or upgrade to; the bound version for uninstall.
    pub app_version_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_ref: Option<PackageRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conf: Option<String>,
}

impl ReleaseIntent {
    pub fn for_application(kind: IntentKind, app: &Application, package_ref: Option<PackageRef>) -> Self {
        let app_version_id = match kind {
            IntentKind::Upgrade => app
                .pending_version_id
                .clone()
                .unwrap_or_else(|| app.app_version_id.clone()),
            IntentKind::Install | IntentKind::Uninstall => app.app_version_id.clone(),
        };
        Self {
            kind,
            application_id: app.id.clone(),
            name: app.name.clone(),
            workspace: app.workspace.clone(),
            cluster: app.cluster.clone(),
            namespace: app.namespace.clone(),
            app_version_id,
            package_ref,
            conf: app.conf.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ReportOutcome {
    Installed,
    Upgraded { version_id: String },
    Uninstalled,
    Failed { message: String },
    /// The workload was paused outside the catalog, e.g. scaled to zero.
    Suspended,
    Resumed,
}

/// What the orchestrator observed for one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorReport {
    pub application_id: String,
    #[serde(flatten)]
    pub outcome: ReportOutcome,
}

impl OrchestratorReport {
    pub fn new(application_id: impl Into<String>, outcome: ReportOutcome) -> Self {
        Self {
            application_id: application_id.into(),
            outcome,
        }
    }
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Hands over an intent. Must not wait for the release to converge.
    async fn submit(&self, intent: ReleaseIntent) -> Result<()>;

    /// Current outcome for an application in a transitional status, if the
    /// orchestrator has one to report.
    async fn poll(&self, app: &Application) -> Result<Option<OrchestratorReport>>;
}

/// Accepts every intent and only logs it. Outcomes arrive through the
/// reconcile callback.
#[derive(Debug, Default)]
pub struct LoggingOrchestrator;

#[async_trait]
impl Orchestrator for LoggingOrchestrator {
    async fn submit(&self, intent: ReleaseIntent) -> Result<()> {
        tracing::info!(
            kind = ?intent.kind,
            application_id = %intent.application_id,
            cluster = %intent.cluster,
            namespace = %intent.namespace,
            version = %intent.app_version_id,
            "release intent issued"
        );
        Ok(())
    }

    async fn poll(&self, _app: &Application) -> Result<Option<OrchestratorReport>> {
        Ok(None)
    }
}

/// Forwards intents to an in-process driver over a channel.
#[derive(Debug, Clone)]
pub struct ChannelOrchestrator {
    tx: mpsc::UnboundedSender<ReleaseIntent>,
}

impl ChannelOrchestrator {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReleaseIntent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Orchestrator for ChannelOrchestrator {
    async fn submit(&self, intent: ReleaseIntent) -> Result<()> {
        self.tx
            .send(intent)
            .map_err(|_| Error::Internal("orchestrator driver has shut down".into()))
    }

    async fn poll(&self, _app: &Application) -> Result<Option<OrchestratorReport>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_wire_format() {
        let report: OrchestratorReport = serde_json::from_str(
            r#"{"application_id":"a1","outcome":"upgraded","version_id":"v2"}"#,
        )
        .unwrap();
        assert_eq!(
            report,
            OrchestratorReport::new("a1", ReportOutcome::Upgraded { version_id: "v2".into() })
        );

        let json = serde_json::to_value(OrchestratorReport::new(
            "a1",
            ReportOutcome::Failed { message: "image pull".into() },
        ))
        .unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["message"], "image pull");
    }

    #[tokio::test]
    async fn test_channel_orchestrator_reports_closed_driver() {
        let (orchestrator, rx) = ChannelOrchestrator::new();
        drop(rx);
        let intent = ReleaseIntent {
            kind: IntentKind::Install,
            application_id: "a1".into(),
            name: "web".into(),
            workspace: "ws".into(),
            cluster: "c1".into(),
            namespace: "default".into(),
            app_version_id: "v1".into(),
            package_ref: None,
            conf: None,
        };
        assert!(matches!(
            orchestrator.submit(intent).await.unwrap_err(),
            Error::Internal(_)
        ));
    }
}

//! Background task feeding orchestrator reports into the release manager.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{OrchestratorReport, ReconcileOutcome, ReleaseManager};

/// Drains pushed reports and periodically polls the orchestrator for
/// applications stuck in a transitional status.
pub struct Reconciler {
    manager: Arc<ReleaseManager>,
    reports: mpsc::Receiver<OrchestratorReport>,
    poll_interval: Duration,
}

impl Reconciler {
    /// Returns the reconciler and the sender orchestrator drivers push into.
    pub fn new(
        manager: Arc<ReleaseManager>,
        poll_interval: Duration,
        capacity: usize,
    ) -> (Self, mpsc::Sender<OrchestratorReport>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                manager,
                reports: rx,
                poll_interval,
            },
            tx,
        )
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs until `shutdown` fires or every report sender is dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(interval_ms = self.poll_interval.as_millis() as u64, "reconciler started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                report = self.reports.recv() => match report {
                    Some(report) => self.handle(&report),
                    None => break,
                },
                _ = ticker.tick() => {
                    match self.manager.poll_orchestrator().await {
                        Ok(0) => {}
                        Ok(applied) => tracing::debug!(applied, "applied polled reports"),
                        Err(e) => tracing::error!(error = %e, "orchestrator poll failed"),
                    }
                }
            }
        }
        tracing::info!("reconciler stopped");
    }

    fn handle(&self, report: &OrchestratorReport) {
        match self.manager.reconcile(report) {
            Ok(ReconcileOutcome::Applied { application }) => {
                tracing::debug!(application_id = %application.id, status = %application.status, "report applied");
            }
            Ok(ReconcileOutcome::Ignored { status }) => {
                tracing::debug!(application_id = %report.application_id, %status, "stale report ignored");
            }
            Err(e) => {
                tracing::warn!(application_id = %report.application_id, error = %e, "report not applied");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::release::{CreateApplication, Orchestrator, ReleaseIntent, ReportOutcome};
    use crate::store::{SqliteStore, Store};
    use crate::types::*;

    /// Reports every transitional application as converged.
    struct ConvergingOrchestrator;

    #[async_trait::async_trait]
    impl Orchestrator for ConvergingOrchestrator {
        async fn submit(&self, _intent: ReleaseIntent) -> Result<()> {
            Ok(())
        }

        async fn poll(&self, app: &Application) -> Result<Option<OrchestratorReport>> {
            let outcome = match app.status {
                ApplicationStatus::Creating => ReportOutcome::Installed,
                ApplicationStatus::Deleting => ReportOutcome::Uninstalled,
                _ => return Ok(None),
            };
            Ok(Some(OrchestratorReport::new(&app.id, outcome)))
        }
    }

    fn manager() -> Arc<ReleaseManager> {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        let store: Arc<dyn Store> = Arc::new(store);
        let now = timestamp_now();
        let template = AppTemplate {
            id: "t1".into(),
            repository_id: None,
            workspace: Some("ws1".into()),
            name: "redis".into(),
            description: None,
            owner: "alice".into(),
            category_id: None,
            status: TemplateStatus::Active,
            suspended_by: None,
            created_at: now,
            updated_at: now,
            stamp: 1,
        };
        let version = AppVersion {
            id: "v1".into(),
            app_template_id: "t1".into(),
            version: "7.0.0".into(),
            description: None,
            package_ref: PackageRef::Attachment("a1".into()),
            owner: "alice".into(),
            status: VersionStatus::Active,
            created_at: now,
            updated_at: now,
            stamp: 1,
        };
        store.create_template(&template, Some(&version)).unwrap();
        Arc::new(ReleaseManager::new(store, Arc::new(ConvergingOrchestrator)))
    }

    fn request() -> CreateApplication {
        CreateApplication {
            name: "cache".into(),
            app_version_id: "v1".into(),
            workspace: "ws1".into(),
            cluster: "c1".into(),
            namespace: "default".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_poll_converges_transitional_applications() {
        let manager = manager();
        let app = manager.create_application(&request()).await.unwrap();

        assert_eq!(manager.poll_orchestrator().await.unwrap(), 1);
        assert_eq!(
            manager.describe_application(&app.id).unwrap().status,
            ApplicationStatus::Active
        );
        assert_eq!(manager.poll_orchestrator().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pushed_reports_are_applied_until_shutdown() {
        let manager = manager();
        let app = manager.create_application(&request()).await.unwrap();

        let (reconciler, tx) = Reconciler::new(manager.clone(), Duration::from_secs(3600), 8);
        let shutdown = CancellationToken::new();
        let task = reconciler.spawn(shutdown.clone());

        // The first tick polls immediately; the pushed duplicate is then ignored.
        tx.send(OrchestratorReport::new(&app.id, ReportOutcome::Installed))
            .await
            .unwrap();
        tx.send(OrchestratorReport::new(&app.id, ReportOutcome::Installed))
            .await
            .unwrap();

        for _ in 0..50 {
            if manager.describe_application(&app.id).unwrap().status == ApplicationStatus::Active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            manager.describe_application(&app.id).unwrap().status,
            ApplicationStatus::Active
        );

        shutdown.cancel();
        task.await.unwrap();
    }
}

//! Repository indexer.
//!
//! One index job runs per repository at a time. Within a process, triggers
//! that arrive while a job runs attach to it; across processes the durable
//! [`IndexLease`] row decides who runs and everyone else waits for the lease
//! to be released.

pub mod diff;
pub mod fetch;
pub mod manifest;

pub use diff::INDEXER_ACTOR;
pub use fetch::{Backoff, FetchError, HttpFetcher, ManifestFetcher, RetryPolicy};
pub use manifest::{Manifest, ManifestEntry};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::IndexerConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::store::{LeaseOutcome, NewRepoEvent, Store};
use crate::types::{
    IndexLease, ListQuery, Page, RepoEvent, RepoEventKind, RepoStatus, Repository, VersionAction,
    VersionStatus,
};
use diff::{DiffStats, Plan, Snapshot};
use fetch::{manifest_url, resolve_url, with_retry};

/// Attempts at applying one page when concurrent writers keep moving stamps.
const PAGE_APPLY_ATTEMPTS: u32 = 3;

/// How often a trigger attached to another instance's job polls the lease.
const REMOTE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Upper bound on manifest pages followed in one job.
const MAX_PAGES: u32 = 10_000;

/// Summary of a finished index job, also stored as the detail of its
/// `index-complete` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexReport {
    pub job_id: String,
    pub repository_id: String,
    pub pages: u32,
    #[serde(flatten)]
    pub stats: DiffStats,
}

/// A job failure in a form that can be shared between handles.
#[derive(Debug, Clone, PartialEq)]
struct JobFailure {
    kind: ErrorKind,
    message: String,
}

impl From<&Error> for JobFailure {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.message(),
        }
    }
}

type JobResult = std::result::Result<IndexReport, JobFailure>;

/// Handle to a running or finished index job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: String,
    repository_id: String,
    coalesced: bool,
    result: watch::Receiver<Option<JobResult>>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn repository_id(&self) -> &str {
        &self.repository_id
    }

    /// True when this trigger attached to a job that was already running.
    pub fn coalesced(&self) -> bool {
        self.coalesced
    }

    /// Waits for the job to finish.
    pub async fn wait(mut self) -> Result<IndexReport> {
        let outcome = self
            .result
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Internal(format!("index job {} vanished", self.job_id)))?
            .clone();
        match outcome {
            Some(Ok(report)) => Ok(report),
            Some(Err(failure)) => Err(Error::from_kind(failure.kind, failure.message)),
            None => Err(Error::Internal(format!("index job {} vanished", self.job_id))),
        }
    }
}

struct RunningJob {
    job_id: String,
    result: watch::Receiver<Option<JobResult>>,
    /// None when the job runs in another process.
    cancel: Option<CancellationToken>,
}

struct Inner {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn ManifestFetcher>,
    config: IndexerConfig,
    holder: String,
    jobs: Mutex<HashMap<String, RunningJob>>,
}

#[derive(Clone)]
pub struct Indexer {
    inner: Arc<Inner>,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn Store>,
        fetcher: Arc<dyn ManifestFetcher>,
        config: IndexerConfig,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                fetcher,
                config,
                holder: holder.into(),
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts an index job, or attaches to the one already running.
    pub fn trigger_index(&self, repository_id: &str) -> Result<JobHandle> {
        let mut jobs = self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(job) = jobs.get(repository_id) {
            if job.result.borrow().is_none() {
                tracing::debug!(repository_id, job_id = %job.job_id, "attaching to running index job");
                return Ok(JobHandle {
                    job_id: job.job_id.clone(),
                    repository_id: repository_id.to_string(),
                    coalesced: true,
                    result: job.result.clone(),
                });
            }
        }

        let repo = self
            .inner
            .store
            .get_repository(repository_id)?
            .ok_or_else(|| Error::not_found(format!("repository {repository_id}")))?;
        if repo.status == RepoStatus::Deleted {
            return Err(Error::invalid_state(format!(
                "repository {repository_id} is deleted"
            )));
        }

        let job_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let lease = IndexLease {
            repository_id: repo.id.clone(),
            job_id: job_id.clone(),
            holder: self.inner.holder.clone(),
            acquired_at: now,
            expires_at: now + self.lease_ttl(),
        };

        let (tx, rx) = watch::channel(None);
        match self.inner.store.acquire_index_lease(&lease)? {
            LeaseOutcome::Acquired => {
                let cancel = CancellationToken::new();
                jobs.insert(
                    repo.id.clone(),
                    RunningJob {
                        job_id: job_id.clone(),
                        result: rx.clone(),
                        cancel: Some(cancel.clone()),
                    },
                );
                tracing::info!(repository = %repo.name, job_id = %job_id, "index job started");

                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let result = inner.run_job(&repo, &job_id, &cancel).await;
                    inner.finish(&repo.id, &job_id);
                    let _ = tx.send(Some(result));
                });

                Ok(JobHandle {
                    job_id: lease.job_id,
                    repository_id: lease.repository_id,
                    coalesced: false,
                    result: rx,
                })
            }
            LeaseOutcome::HeldBy(held) => {
                tracing::info!(
                    repository = %repo.name,
                    job_id = %held.job_id,
                    holder = %held.holder,
                    "index job running elsewhere, attaching"
                );
                jobs.insert(
                    repo.id.clone(),
                    RunningJob {
                        job_id: held.job_id.clone(),
                        result: rx.clone(),
                        cancel: None,
                    },
                );

                let inner = self.inner.clone();
                let remote_job = held.job_id.clone();
                tokio::spawn(async move {
                    let result = inner.follow_remote(&held).await;
                    inner.finish(&held.repository_id, &held.job_id);
                    let _ = tx.send(Some(result));
                });

                Ok(JobHandle {
                    job_id: remote_job,
                    repository_id: repo.id,
                    coalesced: true,
                    result: rx,
                })
            }
        }
    }

    /// Index events of a repository in `seq` order.
    pub fn list_events(&self, repository_id: &str, query: &ListQuery) -> Result<Page<RepoEvent>> {
        if self.inner.store.get_repository(repository_id)?.is_none() {
            return Err(Error::not_found(format!("repository {repository_id}")));
        }
        self.inner.store.list_repo_events(repository_id, query)
    }

    /// Signals the local job of a repository to stop at its next page
    /// boundary. Returns false when there is no local job to cancel.
    pub fn cancel(&self, repository_id: &str) -> bool {
        let jobs = self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.get(repository_id).and_then(|j| j.cancel.as_ref()) {
            Some(token) => {
                tracing::info!(repository_id, "cancelling index job");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Re-indexes repositories whose sync period has elapsed until `shutdown`
    /// fires.
    pub fn spawn_periodic_sync(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let indexer = self.clone();
        let period = self.inner.config.sync_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        indexer.sync_due();
                    }
                }
            }
            tracing::debug!("periodic sync stopped");
        })
    }

    /// Triggers every repository that is due; returns the handles started.
    pub fn sync_due(&self) -> Vec<JobHandle> {
        let due = match self.inner.store.list_repositories_due_for_sync(Utc::now()) {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "listing repositories due for sync failed");
                return Vec::new();
            }
        };

        due.iter()
            .filter_map(|repo| match self.trigger_index(&repo.id) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!(repository = %repo.name, error = %e, "scheduled index failed to start");
                    None
                }
            })
            .collect()
    }

    fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.inner.config.lease_ttl())
            .unwrap_or_else(|_| chrono::Duration::minutes(5))
    }
}

impl Inner {
    fn finish(&self, repository_id: &str, job_id: &str) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if jobs.get(repository_id).is_some_and(|j| j.job_id == job_id) {
            jobs.remove(repository_id);
        }
    }

    fn event(&self, repo: &Repository, job_id: &str, kind: RepoEventKind, detail: Option<&str>) {
        let event = NewRepoEvent {
            repository_id: &repo.id,
            job_id,
            kind,
            detail,
        };
        if let Err(e) = self.store.append_repo_event(&event) {
            tracing::error!(repository = %repo.name, %kind, error = %e, "failed to record repo event");
        }
    }

    async fn run_job(&self, repo: &Repository, job_id: &str, cancel: &CancellationToken) -> JobResult {
        self.event(repo, job_id, RepoEventKind::IndexStart, Some(&repo.url));

        let outcome = self.index(repo, job_id, cancel).await;

        let result = match outcome {
            Ok(report) => {
                let detail = serde_json::to_string(&report).unwrap_or_default();
                self.event(repo, job_id, RepoEventKind::IndexComplete, Some(&detail));
                if let Err(e) =
                    self.store
                        .record_index_outcome(&repo.id, RepoStatus::Active, Some(Utc::now()))
                {
                    tracing::error!(repository = %repo.name, error = %e, "failed to record index outcome");
                }
                tracing::info!(
                    repository = %repo.name,
                    job_id,
                    pages = report.pages,
                    versions_created = report.stats.versions_created,
                    versions_suspended = report.stats.versions_suspended,
                    "index job complete"
                );
                Ok(report)
            }
            Err(e) => {
                let detail = match &e {
                    Error::Cancelled(_) => "cancelled".to_string(),
                    other => other.to_string(),
                };
                self.event(repo, job_id, RepoEventKind::IndexFailed, Some(&detail));
                if let Err(err) = self
                    .store
                    .record_index_outcome(&repo.id, RepoStatus::Failed, None)
                {
                    tracing::error!(repository = %repo.name, error = %err, "failed to record index outcome");
                }
                match &e {
                    Error::Cancelled(_) => {
                        tracing::info!(repository = %repo.name, job_id, "index job cancelled");
                    }
                    e if e.kind() == ErrorKind::Internal => {
                        tracing::error!(repository = %repo.name, job_id, error = %e, "index job failed");
                    }
                    e => {
                        tracing::warn!(repository = %repo.name, job_id, error = %e, "index job failed");
                    }
                }
                Err(JobFailure::from(&e))
            }
        };

        if let Err(e) = self.store.release_index_lease(&repo.id, job_id) {
            tracing::error!(repository = %repo.name, error = %e, "failed to release index lease");
        }
        result
    }

    async fn index(
        &self,
        repo: &Repository,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        let policy = RetryPolicy::from(&self.config);
        let mut report = IndexReport {
            job_id: job_id.to_string(),
            repository_id: repo.id.clone(),
            ..IndexReport::default()
        };
        let mut seen: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut visited = HashSet::new();
        let mut url = manifest_url(&repo.url);

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!("index job {job_id}")));
            }
            if !visited.insert(url.clone()) || report.pages >= MAX_PAGES {
                return Err(Error::validation(format!(
                    "manifest pagination loops back to {url}"
                )));
            }

            let body = with_retry(&policy, cancel, &url, || {
                self.fetcher.fetch_page(repo, &url)
            })
            .await?;
            let manifest = Manifest::from_yaml(&body)?;

            report.pages += 1;
            let stats = self.apply_page(repo, job_id, report.pages, &url, &manifest)?;
            report.stats.add(&stats);

            for (name, entries) in &manifest.entries {
                seen.entry(name.clone())
                    .or_default()
                    .extend(entries.iter().map(|e| e.version.clone()));
            }

            self.renew_lease(repo, job_id)?;

            match &manifest.next {
                Some(next) if !next.trim().is_empty() => url = resolve_url(&url, next.trim()),
                _ => break,
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("index job {job_id}")));
        }

        let stats = self.apply_prune(repo, &seen)?;
        report.stats.add(&stats);
        Ok(report)
    }

    fn renew_lease(&self, repo: &Repository, job_id: &str) -> Result<()> {
        let ttl = chrono::Duration::from_std(self.config.lease_ttl())
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        if !self
            .store
            .renew_index_lease(&repo.id, job_id, Utc::now() + ttl)?
        {
            return Err(Error::conflict(format!(
                "index lease for repository {} was lost",
                repo.id
            )));
        }
        Ok(())
    }

    fn snapshot(&self, repo: &Repository) -> Result<Snapshot> {
        let templates = self.store.list_repository_templates(&repo.id)?;
        let mut versions = HashMap::new();
        let mut indexer_suspended = BTreeSet::new();
        for template in &templates {
            let list = self.store.list_template_versions(&template.id)?;
            for v in list.iter().filter(|v| v.status == VersionStatus::Suspended) {
                let audits = self.store.list_audits(&v.id)?;
                if audits.last().is_some_and(|a| {
                    a.actor == INDEXER_ACTOR && a.action == VersionAction::Suspend
                }) {
                    indexer_suspended.insert(v.id.clone());
                }
            }
            versions.insert(template.id.clone(), list);
        }
        Ok(Snapshot {
            templates,
            versions,
            indexer_suspended,
        })
    }

    /// Applies one page and its progress event atomically, replanning when a
    /// concurrent writer moved a stamp underneath.
    fn apply_page(
        &self,
        repo: &Repository,
        job_id: &str,
        page: u32,
        url: &str,
        manifest: &Manifest,
    ) -> Result<DiffStats> {
        self.apply_with_retry(repo, job_id, |snapshot| {
            let plan = diff::plan_page(repo, url, manifest, snapshot);
            let detail = serde_json::json!({
                "page": page,
                "url": url,
                "entries": manifest.version_count(),
                "changes": plan.changes.len(),
            })
            .to_string();
            (plan, Some(detail))
        })
    }

    fn apply_prune(
        &self,
        repo: &Repository,
        seen: &BTreeMap<String, BTreeSet<String>>,
    ) -> Result<DiffStats> {
        self.apply_with_retry(repo, "", |snapshot| (diff::plan_prune(snapshot, seen), None))
    }

    fn apply_with_retry<F>(&self, repo: &Repository, job_id: &str, mut plan: F) -> Result<DiffStats>
    where
        F: FnMut(&Snapshot) -> (Plan, Option<String>),
    {
        let mut attempt = 1;
        loop {
            let snapshot = self.snapshot(repo)?;
            let (plan, detail) = plan(&snapshot);
            let event = detail.as_deref().map(|detail| NewRepoEvent {
                repository_id: &repo.id,
                job_id,
                kind: RepoEventKind::IndexProgress,
                detail: Some(detail),
            });

            if plan.is_empty() {
                if let Some(event) = &event {
                    self.store.append_repo_event(event)?;
                }
                return Ok(plan.stats);
            }

            match self.store.apply_catalog_changes(&plan.changes, event.as_ref()) {
                Ok(_) => {
                    tracing::debug!(
                        repository = %repo.name,
                        changes = plan.changes.len(),
                        "catalog changes applied"
                    );
                    return Ok(plan.stats);
                }
                Err(e @ (Error::Conflict(_) | Error::AlreadyExists(_)))
                    if attempt < PAGE_APPLY_ATTEMPTS =>
                {
                    tracing::warn!(repository = %repo.name, attempt, error = %e, "replanning after concurrent write");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Waits for another holder's job to release the lease, then reports how
    /// it ended from the repository event log.
    async fn follow_remote(&self, lease: &IndexLease) -> JobResult {
        loop {
            tokio::time::sleep(REMOTE_POLL_INTERVAL).await;
            match self.store.get_index_lease(&lease.repository_id) {
                Ok(Some(current)) if current.job_id == lease.job_id => {
                    if current.expires_at < Utc::now() {
                        return Err(JobFailure {
                            kind: ErrorKind::Internal,
                            message: format!(
                                "index job {} on {} stopped renewing its lease",
                                lease.job_id, lease.holder
                            ),
                        });
                    }
                }
                Ok(_) => break,
                Err(e) => return Err(JobFailure::from(&e)),
            }
        }

        let last = self
            .store
            .last_repo_event(&lease.repository_id)
            .map_err(|e| JobFailure::from(&e))?;
        match last {
            Some(event) if event.job_id == lease.job_id => match event.kind {
                RepoEventKind::IndexComplete => Ok(event
                    .detail
                    .as_deref()
                    .and_then(|d| serde_json::from_str(d).ok())
                    .unwrap_or_else(|| IndexReport {
                        job_id: lease.job_id.clone(),
                        repository_id: lease.repository_id.clone(),
                        ..IndexReport::default()
                    })),
                _ => Err(JobFailure {
                    kind: if event.detail.as_deref() == Some("cancelled") {
                        ErrorKind::Cancelled
                    } else {
                        ErrorKind::Internal
                    },
                    message: event
                        .detail
                        .unwrap_or_else(|| format!("index job {} failed", lease.job_id)),
                }),
            },
            _ => Err(JobFailure {
                kind: ErrorKind::Internal,
                message: format!("index job {} ended without an outcome", lease.job_id),
            }),
        }
    }
}

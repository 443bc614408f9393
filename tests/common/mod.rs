//! Shared fixtures for the integration tests: an in-memory service stack, a
//! scripted manifest source and an HTTP request helper.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::Value;
use tokio::sync::Notify;
use tower::ServiceExt;

use appshelf::attachment::MemoryBlobStore;
use appshelf::config::IndexerConfig;
use appshelf::indexer::{FetchError, ManifestFetcher};
use appshelf::release::{ChannelOrchestrator, ReleaseIntent};
use appshelf::server::{AppState, create_router};
use appshelf::store::{SqliteStore, Store};
use appshelf::types::Repository;

pub const CHARTS_URL: &str = "https://charts.example.com";

pub fn page_url(name: &str) -> String {
    format!("{CHARTS_URL}/{name}")
}

/// Serves manifest pages from a script. Each URL holds a queue of responses;
/// the last one repeats. A gated URL holds its response until released.
#[derive(Default)]
pub struct ScriptedFetcher {
    pages: Mutex<HashMap<String, VecDeque<Result<String, FetchError>>>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(&self, url: &str, body: &str) -> &Self {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), VecDeque::from([Ok(body.to_string())]));
        self
    }

    /// Fails `failures` times with a transient error, then serves `body`.
    pub fn flaky_page(&self, url: &str, failures: usize, body: &str) -> &Self {
        let mut script: VecDeque<_> = (0..failures)
            .map(|i| Err(FetchError::Transient(format!("HTTP 503 (attempt {})", i + 1))))
            .collect();
        script.push_back(Ok(body.to_string()));
        self.pages.lock().unwrap().insert(url.to_string(), script);
        self
    }

    pub fn failing_page(&self, url: &str) -> &Self {
        self.pages.lock().unwrap().insert(
            url.to_string(),
            VecDeque::from([Err(FetchError::Transient("HTTP 502".into()))]),
        );
        self
    }

    /// Holds fetches of `url` until the returned gate is notified.
    pub fn gate(&self, url: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(url.to_string(), gate.clone());
        gate
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    /// Polls until `url` has been requested at least once.
    pub async fn wait_for_call(&self, url: &str) {
        for _ in 0..500 {
            if self.calls(url) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{url} was never fetched");
    }
}

#[async_trait]
impl ManifestFetcher for ScriptedFetcher {
    async fn fetch_page(&self, _repo: &Repository, url: &str) -> Result<String, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        let gate = self.gates.lock().unwrap().get(url).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut pages = self.pages.lock().unwrap();
        let Some(script) = pages.get_mut(url) else {
            return Err(FetchError::Permanent(format!("{url}: HTTP 404")));
        };
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap()
        }
    }

    async fn fetch_package(&self, _repo: &Repository, url: &str) -> Result<Vec<u8>, FetchError> {
        let name = url.rsplit('/').next().unwrap_or("package.tgz");
        let chart = name.trim_end_matches(".tgz");
        let (chart_name, version) = chart.rsplit_once('-').unwrap_or((chart, "0.1.0"));
        Ok(chart_tarball(chart_name, version))
    }
}

/// A gzip tarball holding `<name>/Chart.yaml` and a values file.
pub fn chart_tarball(name: &str, version: &str) -> Vec<u8> {
    let chart_yaml = format!("apiVersion: v2\nname: {name}\nversion: {version}\ndescription: {name} chart\n");
    let files = [
        (format!("{name}/Chart.yaml"), chart_yaml),
        (format!("{name}/values.yaml"), "replicaCount: 1\n".to_string()),
    ];

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in &files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn fast_indexer_config() -> IndexerConfig {
    IndexerConfig {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        ..IndexerConfig::default()
    }
}

/// The full service stack over an in-memory database.
pub struct TestApp {
    pub state: Arc<AppState>,
    pub store: Arc<dyn Store>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub intents: Mutex<tokio::sync::mpsc::UnboundedReceiver<ReleaseIntent>>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_fetcher(ScriptedFetcher::new())
    }

    pub fn with_fetcher(fetcher: ScriptedFetcher) -> Self {
        let store = SqliteStore::in_memory().expect("open in-memory store");
        store.initialize().expect("initialize schema");
        let store: Arc<dyn Store> = Arc::new(store);
        let fetcher = Arc::new(fetcher);
        let (orchestrator, intents) = ChannelOrchestrator::new();

        let state = Arc::new(AppState::new(
            store.clone(),
            Arc::new(MemoryBlobStore::new()),
            fetcher.clone(),
            Arc::new(orchestrator),
            fast_indexer_config(),
            "test-node",
        ));

        Self {
            state,
            store,
            fetcher,
            intents: Mutex::new(intents),
        }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Intents issued to the orchestrator so far.
    pub fn drain_intents(&self) -> Vec<ReleaseIntent> {
        let mut rx = self.intents.lock().unwrap();
        let mut out = Vec::new();
        while let Ok(intent) = rx.try_recv() {
            out.push(intent);
        }
        out
    }
}

/// A caller identity sent through the authentication headers.
#[derive(Debug, Clone, Copy)]
pub struct As<'a> {
    pub name: &'a str,
    pub roles: &'a str,
}

pub const ADMIN: As<'static> = As {
    name: "root",
    roles: "admin",
};
pub const REVIEWER: As<'static> = As {
    name: "rita",
    roles: "reviewer",
};

pub fn user(name: &str) -> As<'_> {
    As { name, roles: "" }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestResponse {
    pub fn data(&self) -> &Value {
        &self.body["data"]
    }

    pub fn error(&self) -> Option<&str> {
        self.body["error"].as_str()
    }
}

pub fn json_request(method: &str, uri: &str, actor: Option<As<'_>>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(actor) = actor {
        builder = builder.header("x-actor", actor.name);
        if !actor.roles.is_empty() {
            builder = builder.header("x-actor-roles", actor.roles);
        }
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn send(router: &Router, request: Request<Body>) -> TestResponse {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
    };
    TestResponse { status, body }
}

pub async fn call(
    router: &Router,
    method: &str,
    uri: &str,
    actor: Option<As<'_>>,
    body: Option<Value>,
) -> TestResponse {
    send(router, json_request(method, uri, actor, body)).await
}

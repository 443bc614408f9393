//! HTTP surface tests: envelopes, status codes, identity headers and
//! workspace scoping, served in-process through the router.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};

use common::{ADMIN, CHARTS_URL, REVIEWER, ScriptedFetcher, TestApp, call, chart_tarball, page_url, send, user};

async fn create_repo(router: &axum::Router, uri: &str, name: &str) -> Value {
    let resp = call(
        router,
        "POST",
        uri,
        Some(ADMIN),
        Some(json!({"name": name, "url": CHARTS_URL})),
    )
    .await;
    assert_eq!(resp.status, StatusCode::CREATED, "{:?}", resp.body);
    resp.data().clone()
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let resp = call(&app.router(), "GET", "/health", None, None).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body, Value::String("OK".into()));
}

#[tokio::test]
async fn test_identity_headers_gate_mutations() {
    let app = TestApp::new();
    let router = app.router();
    let body = json!({"name": "stable", "url": CHARTS_URL});

    let resp = call(&router, "POST", "/api/v1/repos", None, Some(body.clone())).await;
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    assert!(resp.body["data"].is_null());
    assert!(resp.error().is_some());

    let resp = call(&router, "POST", "/api/v1/repos", Some(user("bob")), Some(body.clone())).await;
    assert_eq!(resp.status, StatusCode::FORBIDDEN);

    let bad_roles = common::As {
        name: "bob",
        roles: "wizard",
    };
    let resp = call(&router, "POST", "/api/v1/repos", Some(bad_roles), Some(body.clone())).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);

    let resp = call(&router, "POST", "/api/v1/repos", Some(ADMIN), Some(body)).await;
    assert_eq!(resp.status, StatusCode::CREATED);
    assert_eq!(resp.data()["scope"], "global");
    assert_eq!(resp.data()["stamp"], 1);
}

#[tokio::test]
async fn test_list_envelope_and_conditions() {
    let app = TestApp::new();
    let router = app.router();
    for name in ["databases", "data-science", "monitoring"] {
        let resp = call(
            &router,
            "POST",
            "/api/v1/categories",
            Some(ADMIN),
            Some(json!({"name": name})),
        )
        .await;
        assert_eq!(resp.status, StatusCode::CREATED);
    }

    let resp = call(&router, "GET", "/api/v1/categories", None, None).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.data()["total"], 3);
    assert_eq!(resp.data()["items"].as_array().unwrap().len(), 3);
    assert!(resp.body["error"].is_null());

    let resp = call(&router, "GET", "/api/v1/categories?conditions=name~data", None, None).await;
    assert_eq!(resp.data()["total"], 2);

    let resp = call(
        &router,
        "GET",
        "/api/v1/categories?conditions=name%3Dmonitoring",
        None,
        None,
    )
    .await;
    assert_eq!(resp.data()["total"], 1);
    assert_eq!(resp.data()["items"][0]["name"], "monitoring");

    let resp = call(
        &router,
        "GET",
        "/api/v1/categories?paging=limit%3D1,page%3D2&orderBy=name",
        None,
        None,
    )
    .await;
    assert_eq!(resp.data()["total"], 3);
    let items = resp.data()["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["name"], "databases");

    let resp = call(&router, "GET", "/api/v1/categories?conditions=oops", None, None).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_workspace_routes_hide_other_workspaces() {
    let app = TestApp::new();
    let router = app.router();
    let repo = create_repo(&router, "/api/v1/workspaces/team-a/repos", "team-charts").await;
    let id = repo["id"].as_str().unwrap();
    assert_eq!(repo["workspace"], "team-a");
    assert_eq!(repo["scope"], "workspace");

    let resp = call(&router, "GET", &format!("/api/v1/workspaces/team-a/repos/{id}"), None, None).await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = call(&router, "GET", &format!("/api/v1/workspaces/team-b/repos/{id}"), None, None).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    let resp = call(&router, "GET", "/api/v1/workspaces/team-b/repos", None, None).await;
    assert_eq!(resp.data()["total"], 0);

    // The unscoped route sees every repository.
    let resp = call(&router, "GET", &format!("/api/v1/repos/{id}"), None, None).await;
    assert_eq!(resp.status, StatusCode::OK);
}

#[tokio::test]
async fn test_if_match_guards_updates() {
    let app = TestApp::new();
    let router = app.router();
    let repo = create_repo(&router, "/api/v1/repos", "stable").await;
    let uri = format!("/api/v1/repos/{}", repo["id"].as_str().unwrap());

    let patch = |if_match: &str| {
        Request::builder()
            .method("PATCH")
            .uri(&uri)
            .header("x-actor", "root")
            .header("x-actor-roles", "admin")
            .header("if-match", if_match)
            .header("content-type", "application/json")
            .body(Body::from(json!({"description": "curated"}).to_string()))
            .unwrap()
    };

    let resp = send(&router, patch("\"7\"")).await;
    assert_eq!(resp.status, StatusCode::CONFLICT);

    let resp = send(&router, patch("not-a-stamp")).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);

    let resp = send(&router, patch("W/\"1\"")).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.data()["stamp"], 2);
    assert_eq!(resp.data()["description"], "curated");

    // The same stamp a second time is stale.
    let resp = send(&router, patch("1")).await;
    assert_eq!(resp.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_validate_query_stores_nothing() {
    let fetcher = ScriptedFetcher::new();
    fetcher.page(
        &page_url("index.yaml"),
        "entries:\n  foo:\n    - {version: 1.0.0, urls: [foo-1.0.0.tgz]}\n    - {version: 1.1.0, urls: [foo-1.1.0.tgz]}\n  bar:\n    - {version: 0.1.0, urls: [bar-0.1.0.tgz]}\nnext: page-2.yaml\n",
    );
    let app = TestApp::with_fetcher(fetcher);
    let router = app.router();

    let body = json!({"name": "stable", "url": CHARTS_URL});
    let resp = call(&router, "POST", "/api/v1/repos?validate", Some(ADMIN), Some(body.clone())).await;
    assert_eq!(resp.status, StatusCode::OK, "{:?}", resp.body);
    assert_eq!(resp.data()["manifest_url"], page_url("index.yaml"));
    assert_eq!(resp.data()["templates"], 2);
    assert_eq!(resp.data()["versions"], 3);
    assert_eq!(resp.data()["paged"], true);

    let unreachable = json!({"name": "other", "url": "https://elsewhere.example.com"});
    let resp = call(&router, "POST", "/api/v1/repos?validate=true", Some(ADMIN), Some(unreachable)).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);

    let resp = call(&router, "GET", "/api/v1/repos", None, None).await;
    assert_eq!(resp.data()["total"], 0);

    // validate=false is an ordinary create.
    let resp = call(&router, "POST", "/api/v1/repos?validate=false", Some(ADMIN), Some(body)).await;
    assert_eq!(resp.status, StatusCode::CREATED);

    let resp = call(
        &router,
        "POST",
        "/api/v1/workspaces/team-a/apps",
        Some(user("dana")),
        Some(json!({"package": STANDARD.encode(chart_tarball("nginx", "1.2.0"))})),
    )
    .await;
    assert_eq!(resp.status, StatusCode::CREATED, "{:?}", resp.body);
    let template_id = resp.data()["template"]["id"].as_str().unwrap().to_string();
    let versions = format!("/api/v1/workspaces/team-a/apps/{template_id}/versions");

    let next = json!({"package": STANDARD.encode(chart_tarball("nginx", "1.3.0"))});
    let resp = call(&router, "POST", &format!("{versions}?validate"), Some(user("dana")), Some(next)).await;
    assert_eq!(resp.status, StatusCode::OK, "{:?}", resp.body);
    assert_eq!(resp.data()["name"], "nginx");
    assert_eq!(resp.data()["version"], "1.3.0");

    let broken = json!({"package": STANDARD.encode(b"not a tarball")});
    let resp = call(&router, "POST", &format!("{versions}?validate"), Some(user("dana")), Some(broken)).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);

    let resp = call(&router, "GET", &versions, None, None).await;
    assert_eq!(resp.data()["total"], 1);
}

#[tokio::test]
async fn test_uploaded_template_review() {
    let app = TestApp::new();
    let router = app.router();
    let package = STANDARD.encode(chart_tarball("nginx", "1.2.0"));

    let resp = call(
        &router,
        "POST",
        "/api/v1/workspaces/team-a/apps",
        Some(user("dana")),
        Some(json!({"package": package})),
    )
    .await;
    assert_eq!(resp.status, StatusCode::CREATED, "{:?}", resp.body);
    let template_id = resp.data()["template"]["id"].as_str().unwrap().to_string();
    let version_id = resp.data()["version"]["id"].as_str().unwrap().to_string();
    assert_eq!(resp.data()["template"]["name"], "nginx");
    assert_eq!(resp.data()["template"]["owner"], "dana");
    assert_eq!(resp.data()["version"]["version"], "1.2.0");
    assert_eq!(resp.data()["version"]["status"], "draft");

    let resp = call(
        &router,
        "POST",
        "/api/v1/workspaces/team-a/apps",
        Some(user("dana")),
        Some(json!({"package": "%%%"})),
    )
    .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);

    let base = format!("/api/v1/workspaces/team-a/apps/{template_id}/versions/{version_id}");

    let resp = call(&router, "GET", &format!("{base}/files"), None, None).await;
    assert_eq!(resp.status, StatusCode::OK);
    let values = resp.data()["nginx/values.yaml"].as_str().unwrap();
    assert_eq!(STANDARD.decode(values).unwrap(), b"replicaCount: 1\n");

    let action = |action: &str| Some(json!({"action": action, "message": "looks fine"}));

    let resp = call(&router, "POST", &format!("{base}/action"), Some(user("dana")), action("submit")).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.data()["version"]["status"], "submitted");
    assert_eq!(resp.data()["record"]["actor"], "dana");

    // The owner may not approve their own submission.
    let resp = call(&router, "POST", &format!("{base}/action"), Some(user("dana")), action("pass")).await;
    assert_eq!(resp.status, StatusCode::FORBIDDEN);

    let resp = call(&router, "POST", &format!("{base}/action"), Some(REVIEWER), action("pass")).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.data()["version"]["status"], "passed");

    let resp = call(&router, "POST", &format!("{base}/action"), Some(REVIEWER), action("pass")).await;
    assert_eq!(resp.status, StatusCode::CONFLICT);

    let resp = call(&router, "GET", &format!("{base}/audits"), None, None).await;
    let audits = resp.data().as_array().unwrap();
    assert_eq!(audits.len(), 2);
    assert_eq!(audits[1]["from_status"], "submitted");
    assert_eq!(audits[1]["to_status"], "passed");

    let resp = call(&router, "GET", "/api/v1/reviews", None, None).await;
    assert_eq!(resp.data()["total"], 2);

    // Another workspace cannot reach the version, nor can a wrong template.
    let resp = call(
        &router,
        "GET",
        &format!("/api/v1/workspaces/team-b/apps/{template_id}/versions/{version_id}"),
        None,
        None,
    )
    .await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
    let resp = call(
        &router,
        "GET",
        &format!("/api/v1/apps/unknown/versions/{version_id}"),
        None,
        None,
    )
    .await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    let resp = send(
        &router,
        Request::builder()
            .uri(format!("{base}/package"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status, StatusCode::OK);
}

#[tokio::test]
async fn test_index_action_and_event_log() {
    let fetcher = ScriptedFetcher::new();
    fetcher.page(
        &page_url("index.yaml"),
        "entries:\n  redis:\n    - {version: 7.0.0, urls: [redis-7.0.0.tgz]}\n",
    );
    let app = TestApp::with_fetcher(fetcher);
    let router = app.router();
    let repo = create_repo(&router, "/api/v1/repos", "stable").await;
    let id = repo["id"].as_str().unwrap();
    let action_uri = format!("/api/v1/repos/{id}/action");

    let resp = call(&router, "POST", &action_uri, Some(user("bob")), Some(json!({"action": "index"}))).await;
    assert_eq!(resp.status, StatusCode::FORBIDDEN);

    let resp = call(&router, "POST", &action_uri, Some(ADMIN), Some(json!({"action": "index"}))).await;
    assert_eq!(resp.status, StatusCode::ACCEPTED);
    assert_eq!(resp.data()["repository_id"], id);
    assert!(resp.data()["job_id"].is_string());

    let events_uri = format!("/api/v1/repos/{id}/events");
    let mut kinds = Vec::new();
    for _ in 0..200 {
        let resp = call(&router, "GET", &events_uri, None, None).await;
        kinds = resp.data()["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["kind"].as_str().unwrap().to_string())
            .collect();
        if kinds.last().is_some_and(|k| k == "index-complete") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(kinds.first().map(String::as_str), Some("index-start"));
    assert_eq!(kinds.last().map(String::as_str), Some("index-complete"));

    let resp = call(&router, "GET", "/api/v1/apps?conditions=name%3Dredis", None, None).await;
    assert_eq!(resp.data()["total"], 1);

    let resp = call(&router, "POST", &action_uri, Some(ADMIN), Some(json!({"action": "cancel"}))).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.data()["cancelled"], false);
}

#[tokio::test]
async fn test_application_lifecycle_over_http() {
    let fetcher = ScriptedFetcher::new();
    fetcher.page(
        &page_url("index.yaml"),
        "entries:\n  redis:\n    - {version: 7.0.0, urls: [redis-7.0.0.tgz]}\n",
    );
    let app = TestApp::with_fetcher(fetcher);
    let router = app.router();
    let repo = create_repo(&router, "/api/v1/repos", "stable").await;
    let repo_id = repo["id"].as_str().unwrap();
    app.state.indexer.trigger_index(repo_id).unwrap().wait().await.unwrap();

    let template = app.store.list_repository_templates(repo_id).unwrap().remove(0);
    let version = app.store.list_template_versions(&template.id).unwrap().remove(0);

    let resp = call(
        &router,
        "POST",
        "/api/v1/workspaces/team-a/applications",
        Some(user("dana")),
        Some(json!({
            "name": "cache",
            "app_version_id": version.id,
            "workspace": "ignored",
            "cluster": "east",
            "namespace": "shop",
        })),
    )
    .await;
    assert_eq!(resp.status, StatusCode::CREATED, "{:?}", resp.body);
    assert_eq!(resp.data()["workspace"], "team-a");
    assert_eq!(resp.data()["status"], "creating");
    let app_id = resp.data()["id"].as_str().unwrap().to_string();

    let report = json!({"application_id": app_id, "outcome": "installed"});
    let resp = call(&router, "POST", "/api/v1/reconcile", None, Some(report.clone())).await;
    assert_eq!(resp.data()["result"], "applied");
    assert_eq!(resp.data()["application"]["status"], "active");
    let resp = call(&router, "POST", "/api/v1/reconcile", None, Some(report)).await;
    assert_eq!(resp.data()["result"], "ignored");

    let resp = call(&router, "GET", "/api/v1/applications?cluster=east", None, None).await;
    assert_eq!(resp.data()["total"], 1);
    let resp = call(&router, "GET", "/api/v1/applications?cluster=west", None, None).await;
    assert_eq!(resp.data()["total"], 0);
    let resp = call(&router, "GET", "/api/v1/workspaces/team-b/applications", None, None).await;
    assert_eq!(resp.data()["total"], 0);

    let uri = format!("/api/v1/workspaces/team-a/applications/{app_id}");
    let resp = call(&router, "DELETE", &format!("/api/v1/repos/{repo_id}"), Some(ADMIN), None).await;
    assert_eq!(resp.status, StatusCode::CONFLICT);

    let resp = call(&router, "DELETE", &uri, Some(user("dana")), None).await;
    assert_eq!(resp.status, StatusCode::NO_CONTENT);
    let resp = call(&router, "DELETE", &uri, Some(user("dana")), None).await;
    assert_eq!(resp.status, StatusCode::NO_CONTENT);
    let resp = call(&router, "GET", &uri, None, None).await;
    assert_eq!(resp.data()["status"], "deleting");

    let kinds: Vec<_> = app.drain_intents().into_iter().map(|i| i.kind).collect();
    assert_eq!(kinds.len(), 2);
}

#[tokio::test]
async fn test_attachment_upload_and_bulk_delete() {
    let app = TestApp::new();
    let router = app.router();

    let boundary = "appshelf-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"icon.png\"\r\nContent-Type: image/png\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(&[0x89, b'P', b'N', b'G', 0, 1, 2, 3]);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    let upload = |body: Vec<u8>, actor: Option<&str>| {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/v1/attachments")
            .header("content-type", format!("multipart/form-data; boundary={boundary}"));
        if let Some(actor) = actor {
            builder = builder.header("x-actor", actor);
        }
        builder.body(Body::from(body)).unwrap()
    };

    let resp = send(&router, upload(body.clone(), None)).await;
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);

    let resp = send(&router, upload(body, Some("dana"))).await;
    assert_eq!(resp.status, StatusCode::CREATED, "{:?}", resp.body);
    assert_eq!(resp.data()["name"], "icon.png");
    assert_eq!(resp.data()["content_type"], "image/png");
    assert_eq!(resp.data()["size"], 8);
    let id = resp.data()["id"].as_str().unwrap().to_string();

    let resp = call(&router, "GET", &format!("/api/v1/attachments/{id}"), None, None).await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = call(
        &router,
        "DELETE",
        &format!("/api/v1/attachments/{id},missing"),
        Some(user("dana")),
        None,
    )
    .await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.data()[id.as_str()]["outcome"], "deleted");
    assert_eq!(resp.data()["missing"]["outcome"], "not_found");

    let resp = call(&router, "GET", &format!("/api/v1/attachments/{id}"), None, None).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
}

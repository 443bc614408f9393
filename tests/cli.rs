//! CLI integration tests for the appshelf binary.
//!
//! Each test uses an isolated temp directory for the database, ensuring tests
//! can run in parallel safely.

#![allow(deprecated)] // Command::cargo_bin deprecation only affects custom build dirs

use std::path::Path;

use assert_cmd::Command;
use assert_fs::TempDir;
use predicates::prelude::*;

use appshelf::config::{AppConfig, CONFIG_FILE};
use appshelf::store::{SqliteStore, Store};

struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    fn data_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    fn data_dir_str(&self) -> String {
        self.data_dir().to_string_lossy().to_string()
    }

    fn cmd(&self, args: &[&str]) -> assert_cmd::assert::Assert {
        Command::cargo_bin("appshelf")
            .expect("failed to find binary")
            .args(args)
            .args(["--data-dir", &self.data_dir_str()])
            .assert()
    }

    fn init(&self) -> assert_cmd::assert::Assert {
        self.cmd(&["init"])
    }
}

#[test]
fn test_init_creates_database_and_config() {
    let ctx = TestContext::new();
    ctx.init()
        .success()
        .stdout(predicate::str::contains("Initialized"));

    let config = AppConfig::load(ctx.data_dir()).expect("load written config");
    assert!(config.server.db_path().exists());
    assert!(config.server.blob_dir().is_dir());
    assert!(ctx.data_dir().join(CONFIG_FILE).exists());

    let store = SqliteStore::new(config.server.db_path()).expect("open database");
    store.initialize().expect("schema is idempotent");
}

#[test]
fn test_init_twice_fails() {
    let ctx = TestContext::new();
    ctx.init().success();
    ctx.init()
        .failure()
        .stderr(predicate::str::contains("Already initialized"));
}

#[test]
fn test_serve_requires_init() {
    let ctx = TestContext::new();
    ctx.cmd(&["serve"])
        .failure()
        .stderr(predicate::str::contains("Server not initialized"));
}

#[test]
fn test_index_unknown_repository_fails() {
    let ctx = TestContext::new();
    ctx.init().success();
    ctx.cmd(&["index", "no-such-repo"])
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_invalid_config_is_reported() {
    let ctx = TestContext::new();
    ctx.init().success();
    std::fs::write(ctx.data_dir().join(CONFIG_FILE), "[server]\nport = \"high\"\n")
        .expect("write config");
    ctx.cmd(&["serve"]).failure();
}

//! # Appshelf
//!
//! An application catalog server: package repositories are indexed into app
//! templates and versions, versions move through a review workflow, and
//! applications track deployments of released versions. Usable both as a
//! standalone binary and as a library.
//!
//! ## Library Usage
//!
//! ```toml
//! [dependencies]
//! appshelf = { version = "0.0.1", default-features = false }
//! ```
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use appshelf::attachment::FsBlobStore;
//! use appshelf::config::AppConfig;
//! use appshelf::indexer::HttpFetcher;
//! use appshelf::release::LoggingOrchestrator;
//! use appshelf::server::{AppState, create_router};
//! use appshelf::store::{SqliteStore, Store};
//!
//! let config = AppConfig::load("./data".as_ref()).unwrap();
//! let store = SqliteStore::new(config.server.db_path()).unwrap();
//! store.initialize().unwrap();
//!
//! let state = Arc::new(AppState::new(
//!     Arc::new(store),
//!     Arc::new(FsBlobStore::new(&config.server.blob_dir())),
//!     Arc::new(HttpFetcher::new().unwrap()),
//!     Arc::new(LoggingOrchestrator),
//!     config.indexer.clone(),
//!     config.server.instance_id(),
//! ));
//! let router = create_router(state);
//! // Serve with axum...
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): Builds the `appshelf` binary. Disable with `default-features = false`.

pub mod attachment;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod error;
pub mod indexer;
pub mod package;
pub mod release;
pub mod server;
pub mod store;
pub mod types;
pub mod workflow;

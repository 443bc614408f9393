//! File-based configuration. Every section has defaults, so an absent or
//! partial `appshelf.toml` is valid.

mod server;

pub use server::ServerConfig;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const CONFIG_FILE: &str = "appshelf.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub indexer: IndexerConfig,
    pub release: ReleaseConfig,
}

impl AppConfig {
    /// Reads `<data_dir>/appshelf.toml`, falling back to defaults when the
    /// file does not exist. The returned config always points at `data_dir`.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => Self::from_toml(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        config.server.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(raw).map_err(|e| Error::Config(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let idx = &self.indexer;
        if idx.max_attempts == 0 {
            return Err(Error::Config("indexer.max_attempts must be at least 1".into()));
        }
        if idx.initial_backoff_ms > idx.max_backoff_ms {
            return Err(Error::Config(
                "indexer.initial_backoff_ms must not exceed indexer.max_backoff_ms".into(),
            ));
        }
        if idx.fetch_timeout_secs == 0 || idx.lease_ttl_secs == 0 {
            return Err(Error::Config(
                "indexer timeouts must be greater than zero".into(),
            ));
        }
        if self.release.reconcile_interval_secs == 0 {
            return Err(Error::Config(
                "release.reconcile_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Fetch attempts per page, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub fetch_timeout_secs: u64,
    pub lease_ttl_secs: u64,
    /// How often the periodic sync task looks for due repositories.
    pub sync_check_secs: u64,
    /// Bearer tokens for private repositories, keyed by `credential_ref`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, String>,
}

impl IndexerConfig {
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    #[must_use]
    pub fn sync_check_interval(&self) -> Duration {
        Duration::from_secs(self.sync_check_secs.max(1))
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            fetch_timeout_secs: 30,
            lease_ttl_secs: 300,
            sync_check_secs: 60,
            credentials: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    pub reconcile_interval_secs: u64,
}

impl ReleaseConfig {
    #[must_use]
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 30,
        }
    }
}

//! Repository manifest (`index.yaml`) parsing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One page of a repository manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub api_version: String,

    #[serde(default)]
    pub generated: Option<String>,

    /// Package versions keyed by package name.
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<ManifestEntry>>,

    /// Continuation URL, relative to this page or absolute.
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub urls: Vec<String>,

    #[serde(default)]
    pub digest: Option<String>,

    #[serde(default)]
    pub created: Option<String>,

    #[serde(default)]
    pub deprecated: bool,
}

impl ManifestEntry {
    /// The first non-blank URL, which is where the package is fetched from.
    pub fn package_url(&self) -> Option<&str> {
        self.urls.iter().map(|u| u.trim()).find(|u| !u.is_empty())
    }
}

impl Manifest {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let manifest: Manifest = serde_yaml::from_str(content)
            .map_err(|e| Error::validation(format!("malformed manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, versions) in &self.entries {
            if name.trim().is_empty() {
                return Err(Error::validation("manifest entry with an empty name"));
            }
            let mut seen = std::collections::BTreeSet::new();
            for entry in versions {
                if entry.version.trim().is_empty() {
                    return Err(Error::validation(format!(
                        "manifest entry '{name}' has an empty version"
                    )));
                }
                if entry.urls.iter().all(|u| u.trim().is_empty()) {
                    return Err(Error::validation(format!(
                        "manifest entry '{name}' {} has no package URL",
                        entry.version
                    )));
                }
                if !seen.insert(entry.version.as_str()) {
                    return Err(Error::validation(format!(
                        "manifest lists '{name}' {} twice",
                        entry.version
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn version_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

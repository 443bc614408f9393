//! Reading package archives (gzip-compressed tarballs).

use std::collections::BTreeMap;
use std::io::Read;

use flate2::read::GzDecoder;
use serde::Deserialize;
use tar::{Archive, EntryType};

use crate::error::{Error, Result};

/// Upper bound on the unpacked size of a package.
pub const MAX_UNPACKED_BYTES: u64 = 64 * 1024 * 1024;

/// Chart metadata found in a `Chart.yaml` at the top of the package.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
}

/// Reads every regular file of the archive into memory, keyed by path.
pub fn read_files(data: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut archive = Archive::new(GzDecoder::new(data));
    let entries = archive
        .entries()
        .map_err(|e| Error::validation(format!("package is not a gzip tarball: {e}")))?;

    let mut files = BTreeMap::new();
    let mut total: u64 = 0;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::validation(format!("corrupt package entry: {e}")))?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }

        let path = entry
            .path()
            .map_err(|e| Error::validation(format!("invalid path in package: {e}")))?
            .to_string_lossy()
            .into_owned();

        total = total.saturating_add(entry.size());
        if total > MAX_UNPACKED_BYTES {
            return Err(Error::validation("package unpacks to more than the size limit"));
        }

        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut contents)
            .map_err(|e| Error::validation(format!("corrupt package entry {path}: {e}")))?;
        files.insert(path, contents);
    }

    if files.is_empty() {
        return Err(Error::validation("package contains no files"));
    }
    Ok(files)
}

/// Validates the archive and returns its chart metadata, if it has any.
pub fn inspect(data: &[u8]) -> Result<Option<PackageInfo>> {
    let files = read_files(data)?;
    let chart = files.iter().find(|(path, _)| {
        let depth = path.trim_start_matches("./").matches('/').count();
        path.ends_with("Chart.yaml") && depth <= 1
    });

    let Some((path, raw)) = chart else {
        return Ok(None);
    };

    let info: PackageInfo = serde_yaml::from_slice(raw)
        .map_err(|e| Error::validation(format!("invalid {path}: {e}")))?;
    if info.name.trim().is_empty() || info.version.trim().is_empty() {
        return Err(Error::validation(format!("{path} must set name and version")));
    }
    Ok(Some(info))
}

use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 100;
const MAX_VERSION_LEN: usize = 64;

fn is_valid_name_char(c: char, allow_period: bool) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || (allow_period && c == '.')
}

fn validate_name(
    name: &str,
    entity: &str,
    max_len: usize,
    allow_period: bool,
    forbid_leading_special: bool,
) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation(format!("{entity} cannot be empty")));
    }
    if name.len() > max_len {
        return Err(Error::validation(format!(
            "{entity} cannot exceed {max_len} characters"
        )));
    }
    if !name.chars().all(|c| is_valid_name_char(c, allow_period)) {
        let mut allowed = "alphanumeric characters, hyphens, and underscores".to_string();
        if allow_period {
            allowed.push_str(", and periods");
        }
        return Err(Error::validation(format!(
            "{entity} can only contain {allowed}"
        )));
    }
    if forbid_leading_special && (name.starts_with('-') || name.starts_with('_')) {
        return Err(Error::validation(format!(
            "{entity} cannot start with a hyphen or underscore"
        )));
    }
    Ok(())
}

pub fn validate_repo_name(name: &str) -> Result<()> {
    validate_name(name, "repository name", MAX_NAME_LEN, true, true)
}

pub fn validate_template_name(name: &str) -> Result<()> {
    validate_name(name, "app name", MAX_NAME_LEN, true, true)
}

pub fn validate_version(version: &str) -> Result<()> {
    // Semver build metadata
    if let Some((core, build)) = version.split_once('+') {
        validate_name(core, "version", MAX_VERSION_LEN, true, true)?;
        return validate_name(build, "version build metadata", MAX_VERSION_LEN, true, false);
    }
    validate_name(version, "version", MAX_VERSION_LEN, true, true)
}

pub fn validate_category_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::validation("category name cannot be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::validation(format!(
            "category name cannot exceed {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// Repository URLs must be http, https or file URLs with something after the
/// scheme.
pub fn validate_repo_url(url: &str) -> Result<()> {
    let Some((scheme, rest)) = url.split_once("://") else {
        return Err(Error::validation(format!("repository url '{url}' has no scheme")));
    };
    if !matches!(scheme, "http" | "https" | "file") {
        return Err(Error::validation(format!(
            "repository url scheme '{scheme}' is not supported"
        )));
    }
    if rest.trim_matches('/').is_empty() {
        return Err(Error::validation(format!("repository url '{url}' has no host or path")));
    }
    Ok(())
}

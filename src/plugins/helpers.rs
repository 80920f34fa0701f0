use semver::Version;

use crate::error::{NovaError, Result};

const MAX_PLUGIN_ID_LEN: usize = 190;

/// Plugin IDs double as directory names, so they are restricted to a
/// filesystem-safe alphabet.
pub fn validate_plugin_id(plugin_id: &str) -> Result<()> {
    if plugin_id.trim().is_empty() {
        return Err(NovaError::validation_error("Plugin id cannot be empty"));
    }
    if plugin_id.len() > MAX_PLUGIN_ID_LEN {
        return Err(NovaError::validation_error(format!(
            "Plugin id exceeds {} characters",
            MAX_PLUGIN_ID_LEN
        )));
    }
    if plugin_id.starts_with('.') || plugin_id.starts_with('-') {
        return Err(NovaError::validation_error(format!(
            "Plugin id must start with a letter or digit: {}",
            plugin_id
        )));
    }
    let valid = plugin_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(NovaError::validation_error(format!(
            "Plugin id contains invalid characters: {}",
            plugin_id
        )));
    }
    Ok(())
}

/// Parses a plugin version, tolerating a leading `v`.
pub fn parse_version(version: &str) -> Result<Version> {
    let trimmed = version.trim();
    let raw = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(raw)
        .map_err(|e| NovaError::validation_error(format!("Invalid version '{}': {}", version, e)))
}

pub fn same_version(a: &str, b: &str) -> bool {
    match (parse_version(a), parse_version(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

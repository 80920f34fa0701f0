use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;

use super::dto::{Plugin, PluginClass, PluginSource};
use super::helpers::parse_version;
use super::manifest::{read_manifest, MANIFEST_FILE};

/// Discovers plugins on disk for a set of [`PluginSource`]s.
pub struct PluginLoader;

impl PluginLoader {
    /// Loads every valid plugin. Sources are visited in class precedence
    /// order and the first plugin seen for an ID wins; broken plugins are
    /// logged and skipped.
    pub async fn load(sources: &[PluginSource]) -> Vec<Plugin> {
        let mut ordered: Vec<&PluginSource> = sources.iter().collect();
        ordered.sort_by_key(|source| source.class);

        let mut seen = HashSet::new();
        let mut plugins = Vec::new();
        for source in ordered {
            for path in &source.paths {
                for dir in discover(path).await {
                    match Self::load_dir(&dir, source.class).await {
                        Ok(plugin) => {
                            if seen.insert(plugin.id.clone()) {
                                debug!(plugin_id = %plugin.id, class = %source.class, "Discovered plugin");
                                plugins.push(plugin);
                            } else {
                                warn!(
                                    plugin_id = %plugin.id,
                                    dir = %dir.display(),
                                    "Skipping duplicate plugin"
                                );
                            }
                        }
                        Err(err) => {
                            warn!(dir = %dir.display(), "Failed to load plugin: {}", err);
                        }
                    }
                }
            }
        }
        plugins
    }

    pub async fn load_dir(dir: &Path, class: PluginClass) -> Result<Plugin> {
        let mut manifest = read_manifest(dir).await?;
        match class {
            PluginClass::External => {
                parse_version(&manifest.info.version)?;
            }
            // core plugins ship with the host and often carry no version
            PluginClass::Core | PluginClass::Bundled => {
                if manifest.info.version.trim().is_empty() {
                    manifest.info.version = "0.0.0".to_string();
                }
            }
        }
        Ok(Plugin::from_manifest(manifest, class, dir.to_path_buf()))
    }
}

/// A path is either a plugin directory or a directory of plugin directories.
async fn discover(path: &Path) -> Vec<PathBuf> {
    if is_file(&path.join(MANIFEST_FILE)).await {
        return vec![path.to_path_buf()];
    }

    let mut found = Vec::new();
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(err) => {
            debug!(path = %path.display(), "Plugin source not readable: {}", err);
            return found;
        }
    };
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let candidate = entry.path();
                let hidden = entry.file_name().to_string_lossy().starts_with('.');
                if !hidden && is_file(&candidate.join(MANIFEST_FILE)).await {
                    found.push(candidate);
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(path = %path.display(), "Failed to scan plugin source: {}", err);
                break;
            }
        }
    }
    found.sort();
    found
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

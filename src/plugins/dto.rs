use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::manifest::PluginManifest;

pub const DASHBOARD_INCLUDE: &str = "dashboard";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    App,
    Datasource,
    Panel,
    Renderer,
    SecretsManager,
}

impl PluginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginType::App => "app",
            PluginType::Datasource => "datasource",
            PluginType::Panel => "panel",
            PluginType::Renderer => "renderer",
            PluginType::SecretsManager => "secretsmanager",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a plugin came from. Ordering is load precedence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum PluginClass {
    Core,
    Bundled,
    External,
}

impl fmt::Display for PluginClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PluginClass::Core => "core",
            PluginClass::Bundled => "bundled",
            PluginClass::External => "external",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInclude {
    #[serde(rename = "type")]
    pub include_type: String,
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
}

/// Catalog entry owned by the registry.
#[derive(Debug, Clone)]
pub struct Plugin {
    pub id: String,
    pub name: String,
    pub version: String,
    pub plugin_type: PluginType,
    pub class: PluginClass,
    pub enabled: bool,
    pub decommissioned: bool,
    pub backend: bool,
    pub executable: Option<String>,
    pub includes: Vec<PluginInclude>,
    pub dir: PathBuf,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plugin {
    pub fn from_manifest(manifest: PluginManifest, class: PluginClass, dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: manifest.id,
            name: manifest.name,
            version: manifest.info.version,
            plugin_type: manifest.plugin_type,
            class,
            enabled: true,
            decommissioned: false,
            backend: manifest.backend,
            executable: manifest.executable,
            includes: manifest.includes,
            dir,
            installed_at: now,
            updated_at: now,
        }
    }

    pub fn is_external(&self) -> bool {
        self.class == PluginClass::External
    }
}

/// Read-only snapshot of a [`Plugin`] handed out to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginDto {
    pub id: String,
    pub name: String,
    pub version: String,
    pub plugin_type: PluginType,
    pub class: PluginClass,
    pub enabled: bool,
    pub backend: bool,
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub includes: Vec<PluginInclude>,
    pub dir: PathBuf,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PluginDto {
    pub fn is_renderer(&self) -> bool {
        self.plugin_type == PluginType::Renderer
    }

    pub fn dashboard_paths(&self) -> impl Iterator<Item = &str> {
        self.includes
            .iter()
            .filter(|include| include.include_type == DASHBOARD_INCLUDE)
            .filter_map(|include| include.path.as_deref())
    }
}

impl From<&Plugin> for PluginDto {
    fn from(plugin: &Plugin) -> Self {
        Self {
            id: plugin.id.clone(),
            name: plugin.name.clone(),
            version: plugin.version.clone(),
            plugin_type: plugin.plugin_type,
            class: plugin.class,
            enabled: plugin.enabled,
            backend: plugin.backend,
            executable: plugin.executable.clone(),
            includes: plugin.includes.clone(),
            dir: plugin.dir.clone(),
            installed_at: plugin.installed_at,
            updated_at: plugin.updated_at,
        }
    }
}

/// Request to (re)load every plugin found under `paths` as `class`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginSource {
    pub class: PluginClass,
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateInfo {
    pub plugin_zip_url: String,
}

/// Ledger entry for an install, persisted in sled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallRecord {
    pub plugin_id: String,
    pub version: String,
    #[serde(default)]
    pub plugin_zip_url: Option<String>,
    pub enabled: bool,
    pub installed_at: i64,
    pub updated_at: i64,
}

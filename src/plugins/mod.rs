pub mod dto;
mod helpers;
mod installer;
mod ledger;
mod loader;
mod manager;
mod manifest;
mod registry;
mod repository;

pub use dto::{
    InstallRecord, Plugin, PluginClass, PluginDto, PluginInclude, PluginSource, PluginType,
    UpdateInfo, DASHBOARD_INCLUDE,
};
pub use helpers::{parse_version, validate_plugin_id};
pub use installer::{InstalledArchive, PluginInstaller};
pub use ledger::InstallLedger;
pub use loader::PluginLoader;
pub use manager::PluginManager;
pub use manifest::{parse_manifest, read_manifest, PluginManifest, PluginInfo, MANIFEST_FILE};
pub use registry::{PluginRegistry, PluginStore};
pub use repository::{HttpRepository, UpdateSource};

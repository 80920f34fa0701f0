use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::File;
use tracing::{debug, warn};

use crate::context::CallContext;
use crate::error::{NovaError, Result};
use crate::plugins::{PluginDto, PluginStore};

use super::dto::{
    DashboardFileContent, GetPluginDashboardFileContentsArgs,
    GetPluginDashboardFileContentsResult, ListPluginDashboardFilesArgs,
    ListPluginDashboardFilesResult,
};

/// Dashboards shipped inside plugins.
#[async_trait]
pub trait DashboardFileStore: Send + Sync {
    async fn list_plugin_dashboard_files(
        &self,
        ctx: &CallContext,
        args: ListPluginDashboardFilesArgs,
    ) -> Result<ListPluginDashboardFilesResult>;

    async fn get_plugin_dashboard_file_contents(
        &self,
        ctx: &CallContext,
        args: GetPluginDashboardFileContentsArgs,
    ) -> Result<GetPluginDashboardFileContentsResult>;
}

/// Reads dashboard files from plugin directories on disk.
pub struct FsDashboardFileStore {
    plugins: Arc<dyn PluginStore>,
}

impl FsDashboardFileStore {
    pub fn new(plugins: Arc<dyn PluginStore>) -> Self {
        Self { plugins }
    }

    fn plugin(&self, plugin_id: &str) -> Result<PluginDto> {
        if plugin_id.trim().is_empty() {
            return Err(NovaError::validation_error("plugin_id is required"));
        }
        self.plugins
            .plugin(plugin_id)
            .ok_or_else(|| NovaError::plugin_not_found(plugin_id))
    }
}

#[async_trait]
impl DashboardFileStore for FsDashboardFileStore {
    async fn list_plugin_dashboard_files(
        &self,
        ctx: &CallContext,
        args: ListPluginDashboardFilesArgs,
    ) -> Result<ListPluginDashboardFilesResult> {
        if ctx.is_cancelled() {
            return Err(NovaError::cancelled("list plugin dashboard files"));
        }
        let plugin = self.plugin(&args.plugin_id)?;
        let mut file_references: Vec<String> =
            plugin.dashboard_paths().map(str::to_string).collect();
        file_references.sort();
        file_references.dedup();
        Ok(ListPluginDashboardFilesResult { file_references })
    }

    async fn get_plugin_dashboard_file_contents(
        &self,
        ctx: &CallContext,
        args: GetPluginDashboardFileContentsArgs,
    ) -> Result<GetPluginDashboardFileContentsResult> {
        let plugin = self.plugin(&args.plugin_id)?;
        let reference = args.file_reference.trim();
        if reference.is_empty() {
            return Err(NovaError::validation_error("file_reference is required"));
        }
        let not_found = || NovaError::file_not_found(&plugin.id, reference);

        if !plugin.dashboard_paths().any(|path| path == reference) {
            debug!(plugin_id = %plugin.id, reference, "Not a dashboard of this plugin");
            return Err(not_found());
        }
        let relative = clean_reference(reference).ok_or_else(not_found)?;

        let path = ctx
            .run("open dashboard file", resolve_inside(&plugin.dir, &relative))
            .await?
            .ok_or_else(not_found)?;
        let file = File::open(&path).await.map_err(|err| {
            warn!(plugin_id = %plugin.id, path = %path.display(), "Failed to open dashboard: {}", err);
            not_found()
        })?;
        Ok(GetPluginDashboardFileContentsResult {
            content: DashboardFileContent::new(file),
        })
    }
}

/// Relative path made of normal components only.
fn clean_reference(reference: &str) -> Option<PathBuf> {
    let mut cleaned = PathBuf::new();
    for component in Path::new(reference).components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!cleaned.as_os_str().is_empty()).then_some(cleaned)
}

/// Resolves symlinks and keeps the result inside the plugin directory.
async fn resolve_inside(plugin_dir: &Path, relative: &Path) -> Result<Option<PathBuf>> {
    let root = match tokio::fs::canonicalize(plugin_dir).await {
        Ok(root) => root,
        Err(_) => return Ok(None),
    };
    let target = match tokio::fs::canonicalize(root.join(relative)).await {
        Ok(target) => target,
        Err(_) => return Ok(None),
    };
    if !target.starts_with(&root) {
        return Ok(None);
    }
    let is_file = tokio::fs::metadata(&target)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false);
    Ok(is_file.then_some(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_must_stay_relative() {
        assert_eq!(
            clean_reference("./dashboards/overview.json"),
            Some(PathBuf::from("dashboards/overview.json"))
        );
        assert!(clean_reference("../secrets.json").is_none());
        assert!(clean_reference("/etc/passwd").is_none());
        assert!(clean_reference("dashboards/../../x.json").is_none());
        assert!(clean_reference(".").is_none());
    }
}

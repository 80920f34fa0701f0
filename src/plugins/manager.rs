use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::client::{CloseReason, PluginClient};
use crate::context::CallContext;
use crate::error::{NovaError, Result};

use super::dto::{Plugin, PluginClass, PluginDto, PluginSource};
use super::helpers::{parse_version, same_version, validate_plugin_id};
use super::installer::PluginInstaller;
use super::ledger::InstallLedger;
use super::loader::PluginLoader;
use super::registry::PluginRegistry;
use super::repository::UpdateSource;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Sole writer to the [`PluginRegistry`].
///
/// Operations on one plugin ID are serialized through a per-ID async lock
/// (FIFO, so a racing add and remove apply in arrival order and the last one
/// wins). Operations on different IDs never wait on each other.
pub struct PluginManager {
    registry: Arc<PluginRegistry>,
    client: Arc<PluginClient>,
    installer: PluginInstaller,
    updates: Arc<dyn UpdateSource>,
    ledger: InstallLedger,
    sources: Vec<PluginSource>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    shutdown_timeout: Duration,
}

impl PluginManager {
    pub fn new(
        registry: Arc<PluginRegistry>,
        client: Arc<PluginClient>,
        installer: PluginInstaller,
        updates: Arc<dyn UpdateSource>,
        ledger: InstallLedger,
    ) -> Self {
        Self {
            registry,
            client,
            installer,
            updates,
            ledger,
            sources: Vec::new(),
            locks: DashMap::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_sources(mut self, sources: Vec<PluginSource>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Loads the configured sources, then parks until `ctx` is cancelled and
    /// shuts every backend down.
    pub async fn run(&self, ctx: &CallContext) -> Result<()> {
        let sources = self.sources.clone();
        let loaded = self.load_sources(&sources).await?;
        info!("Plugin manager running with {} plugin(s) loaded", loaded);

        ctx.token().cancelled().await;

        info!("Plugin manager stopping");
        self.client.shutdown_all(self.shutdown_timeout).await;
        Ok(())
    }

    /// Registers plugins found on disk. IDs already in the registry are left
    /// alone. Returns how many plugins were added.
    pub async fn load_sources(&self, sources: &[PluginSource]) -> Result<usize> {
        let mut loaded = 0;
        for mut plugin in PluginLoader::load(sources).await {
            let guard = self.lock(&plugin.id).await;
            if let Some(record) = self.ledger.get(&plugin.id)? {
                plugin.enabled = record.enabled;
                if let Some(installed_at) = chrono::DateTime::from_timestamp(record.installed_at, 0) {
                    plugin.installed_at = installed_at;
                }
            }
            let plugin_id = plugin.id.clone();
            if self.registry.insert_new(plugin) {
                loaded += 1;
            }
            drop(guard);
            self.release_lock(&plugin_id);
        }
        Ok(loaded)
    }

    /// Installs `version` of a plugin, upgrading in place when another
    /// version is installed. Re-adding the installed version is a no-op.
    pub async fn add(&self, ctx: &CallContext, plugin_id: &str, version: &str) -> Result<()> {
        validate_plugin_id(plugin_id)?;
        parse_version(version)?;

        let guard = ctx
            .run("add plugin", async { Ok(self.lock(plugin_id).await) })
            .await?;
        let result = self.add_locked(ctx, plugin_id, version).await;
        drop(guard);
        self.release_lock(plugin_id);
        result
    }

    async fn add_locked(&self, ctx: &CallContext, plugin_id: &str, version: &str) -> Result<()> {
        let existing = self.registry.get(plugin_id);
        if let Some(existing) = &existing {
            if existing.class != PluginClass::External {
                return Err(NovaError::validation_error(format!(
                    "Plugin {} is a {} plugin and cannot be updated",
                    plugin_id, existing.class
                )));
            }
            if same_version(&existing.version, version) && !existing.decommissioned {
                info!(plugin_id, version, "Plugin already installed");
                return Ok(());
            }
        }

        let update = ctx
            .run("resolve plugin archive", self.updates.update_info(plugin_id, version))
            .await?;
        let archive = ctx
            .run(
                "download plugin archive",
                self.updates.download(plugin_id, version, &update),
            )
            .await?;

        // Past this point the swap runs to completion so disk and catalog agree.
        let installed = self.installer.install(plugin_id, version, archive).await?;
        let record = self
            .ledger
            .record_install(plugin_id, version, Some(update.plugin_zip_url.clone()))?;

        let mut plugin = Plugin::from_manifest(installed.manifest, PluginClass::External, installed.dir);
        plugin.enabled = record.enabled;
        if let Some(previous) = &existing {
            plugin.installed_at = previous.installed_at;
        }
        plugin.updated_at = Utc::now();

        match self.registry.upsert(plugin) {
            Some(previous) => {
                info!(
                    plugin_id,
                    from = %previous.version,
                    to = version,
                    "Plugin upgraded"
                );
                self.client.retire(plugin_id, CloseReason::Superseded);
            }
            None => info!(plugin_id, version, "Plugin installed"),
        }
        Ok(())
    }

    /// Uninstalls a plugin. The backend handle is shut down first; when that
    /// does not finish within the shutdown timeout the plugin stays installed
    /// and `InUse` is returned.
    pub async fn remove(&self, ctx: &CallContext, plugin_id: &str) -> Result<()> {
        let guard = ctx
            .run("remove plugin", async { Ok(self.lock(plugin_id).await) })
            .await?;
        let result = self.remove_locked(plugin_id).await;
        drop(guard);
        self.release_lock(plugin_id);
        result
    }

    async fn remove_locked(&self, plugin_id: &str) -> Result<()> {
        let plugin = self
            .registry
            .get(plugin_id)
            .filter(|plugin| !plugin.decommissioned)
            .ok_or_else(|| NovaError::plugin_not_found(plugin_id))?;
        if !plugin.is_external() {
            return Err(NovaError::validation_error(format!(
                "Plugin {} is a {} plugin and cannot be removed",
                plugin_id, plugin.class
            )));
        }

        self.registry
            .update(plugin_id, |plugin| plugin.decommissioned = true);

        if let Err(err) = self
            .client
            .shutdown_backend(plugin_id, self.shutdown_timeout)
            .await
        {
            warn!(plugin_id, "Plugin removal aborted: {}", err);
            self.registry
                .update(plugin_id, |plugin| plugin.decommissioned = false);
            return Err(err);
        }

        if let Err(err) = self.ledger.remove(plugin_id) {
            warn!(plugin_id, "Plugin removal aborted: {}", err);
            self.registry
                .update(plugin_id, |plugin| plugin.decommissioned = false);
            return Err(err);
        }
        self.registry.remove(plugin_id);
        if let Err(err) = self.installer.uninstall(plugin_id).await {
            warn!(plugin_id, "Failed to delete plugin files: {}", err);
        }
        info!(plugin_id, version = %plugin.version, "Plugin removed");
        Ok(())
    }

    pub async fn enable(&self, plugin_id: &str) -> Result<PluginDto> {
        self.set_enabled(plugin_id, true).await
    }

    /// Disables a plugin and retires its backend handle.
    pub async fn disable(&self, plugin_id: &str) -> Result<PluginDto> {
        self.set_enabled(plugin_id, false).await
    }

    async fn set_enabled(&self, plugin_id: &str, enabled: bool) -> Result<PluginDto> {
        let guard = self.lock(plugin_id).await;
        let result = self.set_enabled_locked(plugin_id, enabled);
        drop(guard);
        self.release_lock(plugin_id);
        result
    }

    fn set_enabled_locked(&self, plugin_id: &str, enabled: bool) -> Result<PluginDto> {
        let current = self
            .registry
            .get(plugin_id)
            .filter(|plugin| !plugin.decommissioned)
            .ok_or_else(|| NovaError::plugin_not_found(plugin_id))?;
        self.ledger
            .set_enabled(plugin_id, &current.version, enabled)?;
        let updated = self
            .registry
            .update(plugin_id, |plugin| plugin.enabled = enabled)
            .ok_or_else(|| NovaError::plugin_not_found(plugin_id))?;
        if !enabled {
            self.client.retire(plugin_id, CloseReason::Disabled);
        }
        info!(plugin_id, enabled, "Plugin enablement changed");
        Ok(PluginDto::from(updated.as_ref()))
    }

    async fn lock(&self, plugin_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(plugin_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Drops the per-ID lock once nobody holds or waits on it.
    fn release_lock(&self, plugin_id: &str) {
        self.locks
            .remove_if(plugin_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

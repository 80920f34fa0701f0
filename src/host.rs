use std::sync::Arc;
use std::time::Duration;

use crate::backend::BackendFactoryProvider;
use crate::client::PluginClient;
use crate::config::NovaConfig;
use crate::dashboards::FsDashboardFileStore;
use crate::plugins::{
    HttpRepository, InstallLedger, PluginInstaller, PluginManager, PluginRegistry, PluginStore,
    UpdateSource,
};
use crate::renderer::RegistryRendererManager;

/// Wires the registry, lifecycle manager, dispatcher and read-side services
/// around one shared catalog.
pub struct PluginHost {
    registry: Arc<PluginRegistry>,
    client: Arc<PluginClient>,
    manager: Arc<PluginManager>,
    dashboards: Arc<FsDashboardFileStore>,
    renderer: Arc<RegistryRendererManager>,
}

impl PluginHost {
    pub fn new(
        config: &NovaConfig,
        provider: Arc<dyn BackendFactoryProvider>,
        updates: Arc<dyn UpdateSource>,
        ledger: InstallLedger,
    ) -> Self {
        let registry = Arc::new(PluginRegistry::new());
        let client = Arc::new(
            PluginClient::new(registry.clone(), provider, config.backend.shutdown_timeout())
                .with_health_check_timeout(config.backend.health_check_timeout())
                .with_request_timeout(config.backend.request_timeout()),
        );
        let manager = Arc::new(
            PluginManager::new(
                registry.clone(),
                client.clone(),
                PluginInstaller::new(config.plugins.plugins_dir.clone()),
                updates,
                ledger,
            )
            .with_sources(config.plugins.sources())
            .with_shutdown_timeout(config.backend.shutdown_timeout()),
        );
        let store: Arc<dyn PluginStore> = registry.clone();

        Self {
            dashboards: Arc::new(FsDashboardFileStore::new(store.clone())),
            renderer: Arc::new(RegistryRendererManager::new(store)),
            registry,
            client,
            manager,
        }
    }

    /// Installs from the configured plugin repository.
    pub fn from_config(
        config: &NovaConfig,
        provider: Arc<dyn BackendFactoryProvider>,
        ledger: InstallLedger,
    ) -> Self {
        let updates = Arc::new(HttpRepository::new(
            config.plugins.repository_url.clone(),
            Duration::from_secs(config.plugins.download_timeout_secs),
        ));
        Self::new(config, provider, updates, ledger)
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Read-only view of the catalog.
    pub fn store(&self) -> Arc<dyn PluginStore> {
        self.registry.clone()
    }

    pub fn client(&self) -> &Arc<PluginClient> {
        &self.client
    }

    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    pub fn dashboards(&self) -> &Arc<FsDashboardFileStore> {
        &self.dashboards
    }

    pub fn renderer(&self) -> &Arc<RegistryRendererManager> {
        &self.renderer
    }
}

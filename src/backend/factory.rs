use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::Result;
use crate::plugins::PluginDto;

use super::process::ProcessBackend;
use super::BackendPlugin;

/// Starts (or attaches to) a backend for one plugin.
pub type BackendFactoryFn =
    Arc<dyn Fn(PluginDto) -> BoxFuture<'static, Result<Arc<dyn BackendPlugin>>> + Send + Sync>;

/// Decides how a plugin's backend is created. `None` means the plugin has no
/// backend to dispatch to.
pub trait BackendFactoryProvider: Send + Sync {
    fn backend_factory(&self, plugin: &PluginDto) -> Option<BackendFactoryFn>;
}

/// In-process registrations first, then the plugin's own executable.
pub struct DefaultBackendProvider {
    registered: DashMap<String, BackendFactoryFn>,
    start_timeout: Duration,
}

impl DefaultBackendProvider {
    pub fn new(start_timeout: Duration) -> Self {
        Self {
            registered: DashMap::new(),
            start_timeout,
        }
    }

    /// Serves `plugin_id` from a shared in-process backend.
    pub fn register_core(&self, plugin_id: impl Into<String>, backend: Arc<dyn BackendPlugin>) {
        let factory: BackendFactoryFn = Arc::new(move |_plugin| {
            let backend = backend.clone();
            async move { Ok(backend) }.boxed()
        });
        self.registered.insert(plugin_id.into(), factory);
    }

    pub fn register_factory(&self, plugin_id: impl Into<String>, factory: BackendFactoryFn) {
        self.registered.insert(plugin_id.into(), factory);
    }

    pub fn unregister(&self, plugin_id: &str) {
        self.registered.remove(plugin_id);
    }
}

impl BackendFactoryProvider for DefaultBackendProvider {
    fn backend_factory(&self, plugin: &PluginDto) -> Option<BackendFactoryFn> {
        if let Some(factory) = self.registered.get(&plugin.id) {
            return Some(factory.value().clone());
        }
        if !plugin.backend || plugin.executable.is_none() {
            return None;
        }

        let start_timeout = self.start_timeout;
        Some(Arc::new(move |plugin: PluginDto| {
            async move {
                let backend = ProcessBackend::launch(&plugin, start_timeout).await?;
                Ok(Arc::new(backend) as Arc<dyn BackendPlugin>)
            }
            .boxed()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{PluginClass, PluginType};
    use chrono::Utc;

    struct Noop;

    impl BackendPlugin for Noop {}

    fn dto(id: &str, backend: bool, executable: Option<&str>) -> PluginDto {
        PluginDto {
            id: id.to_string(),
            name: id.to_string(),
            version: "1.0.0".to_string(),
            plugin_type: PluginType::Datasource,
            class: PluginClass::External,
            enabled: true,
            backend,
            executable: executable.map(str::to_string),
            includes: vec![],
            dir: "/tmp".into(),
            installed_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn frontend_only_plugins_have_no_factory() {
        let provider = DefaultBackendProvider::new(Duration::from_secs(1));
        assert!(provider.backend_factory(&dto("clock", false, None)).is_none());
        assert!(provider.backend_factory(&dto("ds", true, None)).is_none());
        assert!(provider
            .backend_factory(&dto("ds", true, Some("gpx_ds")))
            .is_some());
    }

    #[tokio::test]
    async fn registered_backend_is_shared() {
        let provider = DefaultBackendProvider::new(Duration::from_secs(1));
        let backend: Arc<dyn BackendPlugin> = Arc::new(Noop);
        provider.register_core("testdata", backend.clone());

        let factory = provider.backend_factory(&dto("testdata", false, None)).unwrap();
        let created = factory(dto("testdata", false, None)).await.unwrap();

        assert!(Arc::ptr_eq(&created, &backend));
    }
}

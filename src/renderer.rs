use std::sync::Arc;

use crate::plugins::{PluginDto, PluginStore, PluginType};

/// Looks up the plugin that renders panels to images.
pub trait RendererManager: Send + Sync {
    fn renderer(&self) -> Option<PluginDto>;
}

/// Picks the first enabled renderer in the registry.
pub struct RegistryRendererManager {
    plugins: Arc<dyn PluginStore>,
}

impl RegistryRendererManager {
    pub fn new(plugins: Arc<dyn PluginStore>) -> Self {
        Self { plugins }
    }
}

impl RendererManager for RegistryRendererManager {
    fn renderer(&self) -> Option<PluginDto> {
        self.plugins
            .plugins(&[PluginType::Renderer])
            .into_iter()
            .find(|plugin| plugin.enabled)
    }
}

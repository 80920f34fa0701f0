use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::dto::{Plugin, PluginDto, PluginType};

/// Read side of the plugin catalog.
pub trait PluginStore: Send + Sync {
    /// Finds an installed plugin. Decommissioned plugins are reported absent.
    fn plugin(&self, plugin_id: &str) -> Option<PluginDto>;

    /// Installed plugins of any of `types` (all plugins when empty), in
    /// insertion order.
    fn plugins(&self, types: &[PluginType]) -> Vec<PluginDto>;
}

#[derive(Debug, Clone, Default)]
struct Catalog {
    generation: u64,
    entries: HashMap<String, Arc<Plugin>>,
    order: Vec<String>,
}

/// Versioned copy-on-write catalog.
///
/// Readers clone the current `Arc<Catalog>` and never block on writers for
/// longer than that pointer copy. Writers build the next catalog and swap it
/// in, so a listing never observes a write that started after it began.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    catalog: RwLock<Arc<Catalog>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<Catalog> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write<R>(&self, apply: impl FnOnce(&mut Catalog) -> R) -> R {
        let mut guard = self
            .catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = Catalog::clone(&guard);
        let result = apply(&mut next);
        next.generation += 1;
        *guard = Arc::new(next);
        result
    }

    /// Bumped on every committed write.
    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    pub fn len(&self) -> usize {
        self.snapshot()
            .entries
            .values()
            .filter(|plugin| !plugin.decommissioned)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw entry lookup, decommissioned plugins included.
    pub(crate) fn get(&self, plugin_id: &str) -> Option<Arc<Plugin>> {
        self.snapshot().entries.get(plugin_id).cloned()
    }

    /// Inserts or replaces an entry. A replaced entry keeps its position in
    /// listing order. Returns the previous entry.
    pub(crate) fn upsert(&self, plugin: Plugin) -> Option<Arc<Plugin>> {
        self.write(|catalog| {
            let id = plugin.id.clone();
            let previous = catalog.entries.insert(id.clone(), Arc::new(plugin));
            if previous.is_none() {
                catalog.order.push(id);
            }
            previous
        })
    }

    /// Inserts only when the ID is free. Returns whether it was inserted.
    pub(crate) fn insert_new(&self, plugin: Plugin) -> bool {
        self.write(|catalog| {
            if catalog.entries.contains_key(&plugin.id) {
                return false;
            }
            catalog.order.push(plugin.id.clone());
            catalog.entries.insert(plugin.id.clone(), Arc::new(plugin));
            true
        })
    }

    /// Applies `change` to a copy of the entry and commits it.
    pub(crate) fn update(
        &self,
        plugin_id: &str,
        change: impl FnOnce(&mut Plugin),
    ) -> Option<Arc<Plugin>> {
        self.write(|catalog| {
            let current = catalog.entries.get(plugin_id)?;
            let mut next = Plugin::clone(current);
            change(&mut next);
            let next = Arc::new(next);
            catalog.entries.insert(plugin_id.to_string(), next.clone());
            Some(next)
        })
    }

    pub(crate) fn remove(&self, plugin_id: &str) -> Option<Arc<Plugin>> {
        self.write(|catalog| {
            let removed = catalog.entries.remove(plugin_id)?;
            catalog.order.retain(|id| id != plugin_id);
            Some(removed)
        })
    }
}

impl PluginStore for PluginRegistry {
    fn plugin(&self, plugin_id: &str) -> Option<PluginDto> {
        self.get(plugin_id)
            .filter(|plugin| !plugin.decommissioned)
            .map(|plugin| PluginDto::from(plugin.as_ref()))
    }

    fn plugins(&self, types: &[PluginType]) -> Vec<PluginDto> {
        let catalog = self.snapshot();
        catalog
            .order
            .iter()
            .filter_map(|id| catalog.entries.get(id))
            .filter(|plugin| !plugin.decommissioned)
            .filter(|plugin| types.is_empty() || types.contains(&plugin.plugin_type))
            .map(|plugin| PluginDto::from(plugin.as_ref()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::dto::PluginClass;
    use chrono::Utc;
    use std::path::PathBuf;

    fn plugin(id: &str, version: &str, plugin_type: PluginType) -> Plugin {
        Plugin {
            id: id.to_string(),
            name: id.to_string(),
            version: version.to_string(),
            plugin_type,
            class: PluginClass::External,
            enabled: true,
            decommissioned: false,
            backend: false,
            executable: None,
            includes: vec![],
            dir: PathBuf::from(id),
            installed_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn ids(plugins: &[PluginDto]) -> Vec<&str> {
        plugins.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn listing_keeps_insertion_order_across_upgrades() {
        let registry = PluginRegistry::new();
        registry.upsert(plugin("b-panel", "1.0.0", PluginType::Panel));
        registry.upsert(plugin("a-ds", "1.0.0", PluginType::Datasource));
        registry.upsert(plugin("c-ds", "1.0.0", PluginType::Datasource));
        registry.upsert(plugin("a-ds", "2.0.0", PluginType::Datasource));

        assert_eq!(ids(&registry.plugins(&[])), vec!["b-panel", "a-ds", "c-ds"]);
        let datasources = registry.plugins(&[PluginType::Datasource]);
        assert_eq!(ids(&datasources), vec!["a-ds", "c-ds"]);
        assert_eq!(datasources[0].version, "2.0.0");
    }

    #[test]
    fn filtering_matches_any_listed_type() {
        let registry = PluginRegistry::new();
        registry.upsert(plugin("p", "1.0.0", PluginType::Panel));
        registry.upsert(plugin("r", "1.0.0", PluginType::Renderer));
        registry.upsert(plugin("d", "1.0.0", PluginType::Datasource));

        let listed = registry.plugins(&[PluginType::Renderer, PluginType::Panel]);
        assert_eq!(ids(&listed), vec!["p", "r"]);
    }

    #[test]
    fn decommissioned_plugins_are_hidden() {
        let registry = PluginRegistry::new();
        registry.upsert(plugin("ds-a", "1.0.0", PluginType::Datasource));
        registry.update("ds-a", |p| p.decommissioned = true);

        assert!(registry.plugin("ds-a").is_none());
        assert!(registry.plugins(&[]).is_empty());
        assert!(registry.get("ds-a").is_some());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let registry = PluginRegistry::new();
        registry.upsert(plugin("ds-a", "1.0.0", PluginType::Datasource));
        let before = registry.snapshot();
        let generation = registry.generation();

        registry.remove("ds-a");

        assert!(before.entries.contains_key("ds-a"));
        assert!(registry.plugin("ds-a").is_none());
        assert!(registry.generation() > generation);
    }

    #[test]
    fn insert_new_does_not_replace() {
        let registry = PluginRegistry::new();
        assert!(registry.insert_new(plugin("ds-a", "1.0.0", PluginType::Datasource)));
        assert!(!registry.insert_new(plugin("ds-a", "9.0.0", PluginType::Datasource)));
        assert_eq!(registry.plugin("ds-a").unwrap().version, "1.0.0");
    }
}

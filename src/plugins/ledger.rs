use chrono::Utc;

use crate::error::{NovaError, Result};

use super::dto::InstallRecord;

/// Durable record of installed plugins and their enabled flag.
#[derive(Clone)]
pub struct InstallLedger {
    tree: sled::Tree,
}

impl InstallLedger {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    /// Records an install or upgrade, keeping the enabled flag and original
    /// install time of an earlier record.
    pub fn record_install(
        &self,
        plugin_id: &str,
        version: &str,
        plugin_zip_url: Option<String>,
    ) -> Result<InstallRecord> {
        let now = Utc::now().timestamp();
        let record = match self.get(plugin_id)? {
            Some(existing) => InstallRecord {
                version: version.to_string(),
                plugin_zip_url,
                updated_at: now,
                ..existing
            },
            None => InstallRecord {
                plugin_id: plugin_id.to_string(),
                version: version.to_string(),
                plugin_zip_url,
                enabled: true,
                installed_at: now,
                updated_at: now,
            },
        };
        self.put(&record)?;
        Ok(record)
    }

    pub fn set_enabled(&self, plugin_id: &str, version: &str, enabled: bool) -> Result<InstallRecord> {
        let now = Utc::now().timestamp();
        let mut record = self.get(plugin_id)?.unwrap_or_else(|| InstallRecord {
            plugin_id: plugin_id.to_string(),
            version: version.to_string(),
            plugin_zip_url: None,
            enabled,
            installed_at: now,
            updated_at: now,
        });
        record.enabled = enabled;
        record.updated_at = now;
        self.put(&record)?;
        Ok(record)
    }

    pub fn get(&self, plugin_id: &str) -> Result<Option<InstallRecord>> {
        match self.tree.get(plugin_id.as_bytes())? {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes).map_err(|e| {
                    NovaError::internal(format!("Failed to parse install record: {}", e))
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn remove(&self, plugin_id: &str) -> Result<()> {
        self.tree.remove(plugin_id.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<InstallRecord>> {
        let mut records = Vec::new();
        for item in self.tree.iter() {
            let (_key, value) = item?;
            let record = serde_json::from_slice(&value).map_err(|e| {
                NovaError::internal(format!("Failed to parse install record: {}", e))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    fn put(&self, record: &InstallRecord) -> Result<()> {
        let encoded = serde_json::to_vec(record).map_err(|e| {
            NovaError::internal(format!("Failed to encode install record: {}", e))
        })?;
        self.tree.insert(record.plugin_id.as_bytes(), encoded)?;
        self.tree.flush()?;
        Ok(())
    }
}

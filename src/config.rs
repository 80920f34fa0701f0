use std::path::PathBuf;
use std::time::Duration;

use crate::error::{NovaError, Result};
use crate::plugins::{PluginClass, PluginSource};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NovaConfig {
    pub logging: LoggingConfig,
    pub plugins: PluginsConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Where externally installed plugins are extracted.
    pub plugins_dir: PathBuf,
    pub bundled_dir: Option<PathBuf>,
    pub core_dirs: Vec<PathBuf>,
    pub repository_url: String,
    pub download_timeout_secs: u64,
    /// sled database holding the install ledger.
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub start_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub health_check_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub fn filter_directive(&self) -> String {
        let level = self.log_level.trim();
        if level.contains('=') {
            level.to_string()
        } else {
            format!("nova_plugins={}", if level.is_empty() { "info" } else { level })
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from("data/plugins"),
            bundled_dir: None,
            core_dirs: vec![],
            repository_url: "https://plugins.nova.dev/api".to_string(),
            download_timeout_secs: 60,
            database_path: PathBuf::from("nova_plugins_db"),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            health_check_timeout_ms: 5_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl BackendConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl PluginsConfig {
    /// Sources in class precedence order: core, bundled, external.
    pub fn sources(&self) -> Vec<PluginSource> {
        let mut sources = Vec::new();
        if !self.core_dirs.is_empty() {
            sources.push(PluginSource {
                class: PluginClass::Core,
                paths: self.core_dirs.clone(),
            });
        }
        if let Some(bundled) = &self.bundled_dir {
            sources.push(PluginSource {
                class: PluginClass::Bundled,
                paths: vec![bundled.clone()],
            });
        }
        sources.push(PluginSource {
            class: PluginClass::External,
            paths: vec![self.plugins_dir.clone()],
        });
        sources
    }
}

impl NovaConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        // Override with environment variables
        if let Ok(log_level) = std::env::var("NOVA_PLUGINS_LOG_LEVEL") {
            config.logging.log_level = log_level;
        }

        if let Ok(dir) = std::env::var("NOVA_PLUGINS_DIR") {
            config.plugins.plugins_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("NOVA_PLUGINS_BUNDLED_DIR") {
            if !dir.trim().is_empty() {
                config.plugins.bundled_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(dirs) = std::env::var("NOVA_PLUGINS_CORE_DIRS") {
            config.plugins.core_dirs = dirs
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Ok(url) = std::env::var("NOVA_PLUGINS_REPOSITORY_URL") {
            if !url.trim().is_empty() {
                config.plugins.repository_url = url;
            }
        }
        if let Ok(path) = std::env::var("NOVA_PLUGINS_DB_PATH") {
            config.plugins.database_path = PathBuf::from(path);
        }
        if let Some(secs) = env_number("NOVA_PLUGINS_DOWNLOAD_TIMEOUT_SECS")? {
            config.plugins.download_timeout_secs = secs;
        }

        if let Some(ms) = env_number("NOVA_PLUGINS_START_TIMEOUT_MS")? {
            config.backend.start_timeout_ms = ms;
        }
        if let Some(ms) = env_number("NOVA_PLUGINS_REQUEST_TIMEOUT_MS")? {
            config.backend.request_timeout_ms = ms;
        }
        if let Some(ms) = env_number("NOVA_PLUGINS_HEALTH_TIMEOUT_MS")? {
            config.backend.health_check_timeout_ms = ms;
        }
        if let Some(ms) = env_number("NOVA_PLUGINS_SHUTDOWN_TIMEOUT_MS")? {
            config.backend.shutdown_timeout_ms = ms;
        }

        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NovaError::config_error(format!("Failed to read config file: {}", e)))?;

        let config: NovaConfig = toml::from_str(&content)
            .map_err(|e| NovaError::config_error(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }
}

fn env_number(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| NovaError::config_error(format!("Invalid {}", name))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: NovaConfig = toml::from_str(
            r#"
            [plugins]
            plugins_dir = "/var/lib/nova/plugins"
            core_dirs = ["/usr/share/nova/core"]

            [backend]
            shutdown_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(
            config.plugins.plugins_dir,
            PathBuf::from("/var/lib/nova/plugins")
        );
        assert_eq!(config.backend.shutdown_timeout(), Duration::from_millis(250));
        assert_eq!(config.backend.health_check_timeout_ms, 5_000);
        assert_eq!(config.logging.log_level, "info");
    }

    #[test]
    fn log_level_becomes_the_default_filter() {
        let mut logging = LoggingConfig::default();
        assert_eq!(logging.filter_directive(), "nova_plugins=info");

        logging.log_level = "debug".to_string();
        assert_eq!(logging.filter_directive(), "nova_plugins=debug");

        logging.log_level = "nova_plugins=trace,reqwest=warn".to_string();
        assert_eq!(logging.filter_directive(), "nova_plugins=trace,reqwest=warn");
    }

    #[test]
    fn sources_follow_class_precedence() {
        let mut plugins = PluginsConfig::default();
        plugins.core_dirs = vec![PathBuf::from("core")];
        plugins.bundled_dir = Some(PathBuf::from("bundled"));

        let classes: Vec<_> = plugins.sources().iter().map(|s| s.class).collect();
        assert_eq!(
            classes,
            vec![PluginClass::Core, PluginClass::Bundled, PluginClass::External]
        );
    }
}

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use urlencoding::encode;

use crate::error::{NovaError, Result};

use super::dto::UpdateInfo;

/// Supplies installable archives for plugin versions.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn update_info(&self, plugin_id: &str, version: &str) -> Result<UpdateInfo>;

    async fn download(&self, plugin_id: &str, version: &str, info: &UpdateInfo) -> Result<Vec<u8>>;
}

/// Plugin repository reachable over HTTP. `file://` archive URLs are read
/// from disk, which covers offline installs.
#[derive(Clone)]
pub struct HttpRepository {
    http: Client,
    base_url: String,
}

impl HttpRepository {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("Nova-Plugins/0.1.0")
            .build()
            .unwrap_or_else(|e| {
                tracing::error!("Failed to build HTTP client: {}", e);
                Client::new()
            });
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn download_url(&self, plugin_id: &str, version: &str) -> String {
        format!(
            "{}/plugins/{}/versions/{}/download",
            self.base_url.trim_end_matches('/'),
            encode(plugin_id),
            encode(version)
        )
    }
}

#[async_trait]
impl UpdateSource for HttpRepository {
    async fn update_info(&self, plugin_id: &str, version: &str) -> Result<UpdateInfo> {
        Ok(UpdateInfo {
            plugin_zip_url: self.download_url(plugin_id, version),
        })
    }

    async fn download(&self, plugin_id: &str, version: &str, info: &UpdateInfo) -> Result<Vec<u8>> {
        if let Some(path) = info.plugin_zip_url.strip_prefix("file://") {
            let path = PathBuf::from(path);
            return match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(bytes),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    Err(NovaError::version_not_found(plugin_id, version))
                }
                Err(err) => Err(err.into()),
            };
        }

        tracing::info!(plugin_id, version, url = %info.plugin_zip_url, "Downloading plugin archive");
        let response = self.http.get(&info.plugin_zip_url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(NovaError::version_not_found(plugin_id, version));
        }
        let response = response.error_for_status()?;
        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_url_encodes_segments() {
        let repo = HttpRepository::new("https://plugins.example.com/api/", Duration::from_secs(1));
        assert_eq!(
            repo.download_url("ds-a", "1.0.0+build 1"),
            "https://plugins.example.com/api/plugins/ds-a/versions/1.0.0%2Bbuild%201/download"
        );
    }

    #[tokio::test]
    async fn missing_local_archive_is_version_not_found() {
        let repo = HttpRepository::new("http://localhost", Duration::from_secs(1));
        let info = UpdateInfo {
            plugin_zip_url: "file:///definitely/not/here.zip".to_string(),
        };
        let err = repo.download("ds-a", "1.0.0", &info).await.unwrap_err();
        assert!(matches!(err, NovaError::VersionNotFound { .. }));
    }
}

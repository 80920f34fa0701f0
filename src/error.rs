use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NovaError>;

/// Coarse classification callers branch on (retry, surface to the user, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Disabled,
    InUse,
    PluginRemoved,
    BackendUnavailable,
    Timeout,
    Cancelled,
    Upstream,
    NotImplemented,
    Validation,
    Storage,
    Internal,
}

#[derive(Error, Debug)]
pub enum NovaError {
    #[error("Plugin not found: {plugin_id}")]
    PluginNotFound { plugin_id: String },

    #[error("Plugin {plugin_id} version {version} not found")]
    VersionNotFound { plugin_id: String, version: String },

    #[error("File {reference} not found for plugin {plugin_id}")]
    FileNotFound { plugin_id: String, reference: String },

    #[error("Plugin is disabled: {plugin_id}")]
    PluginDisabled { plugin_id: String },

    #[error("Plugin {plugin_id} is in use: {reason}")]
    InUse { plugin_id: String, reason: String },

    #[error("Plugin {plugin_id} was removed")]
    PluginRemoved { plugin_id: String },

    #[error("Backend unavailable for plugin {plugin_id}: {reason}")]
    BackendUnavailable { plugin_id: String, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("{operation} was cancelled")]
    Cancelled { operation: String },

    #[error("Plugin {plugin_id} returned an error: {message}")]
    Upstream { plugin_id: String, message: String },

    /// Raised by backend implementations; the dispatcher turns it into `Upstream`.
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Method not implemented: {method}")]
    NotImplemented { method: &'static str },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Storage error: {0}")]
    StorageError(#[from] sled::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    ArchiveError(#[from] zip::result::ZipError),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NovaError {
    pub fn plugin_not_found(plugin_id: impl Into<String>) -> Self {
        NovaError::PluginNotFound {
            plugin_id: plugin_id.into(),
        }
    }

    pub fn version_not_found(plugin_id: impl Into<String>, version: impl Into<String>) -> Self {
        NovaError::VersionNotFound {
            plugin_id: plugin_id.into(),
            version: version.into(),
        }
    }

    pub fn file_not_found(plugin_id: impl Into<String>, reference: impl Into<String>) -> Self {
        NovaError::FileNotFound {
            plugin_id: plugin_id.into(),
            reference: reference.into(),
        }
    }

    pub fn plugin_disabled(plugin_id: impl Into<String>) -> Self {
        NovaError::PluginDisabled {
            plugin_id: plugin_id.into(),
        }
    }

    pub fn in_use(plugin_id: impl Into<String>, reason: impl Into<String>) -> Self {
        NovaError::InUse {
            plugin_id: plugin_id.into(),
            reason: reason.into(),
        }
    }

    pub fn plugin_removed(plugin_id: impl Into<String>) -> Self {
        NovaError::PluginRemoved {
            plugin_id: plugin_id.into(),
        }
    }

    pub fn backend_unavailable(plugin_id: impl Into<String>, reason: impl Into<String>) -> Self {
        NovaError::BackendUnavailable {
            plugin_id: plugin_id.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        NovaError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        NovaError::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn upstream(plugin_id: impl Into<String>, message: impl Into<String>) -> Self {
        NovaError::Upstream {
            plugin_id: plugin_id.into(),
            message: message.into(),
        }
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        NovaError::Backend(msg.into())
    }

    pub fn not_implemented(method: &'static str) -> Self {
        NovaError::NotImplemented { method }
    }

    pub fn validation_error(msg: impl Into<String>) -> Self {
        NovaError::ValidationError {
            message: msg.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        NovaError::ConfigError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        NovaError::Internal(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            NovaError::PluginNotFound { .. }
            | NovaError::VersionNotFound { .. }
            | NovaError::FileNotFound { .. } => ErrorKind::NotFound,
            NovaError::PluginDisabled { .. } => ErrorKind::Disabled,
            NovaError::InUse { .. } => ErrorKind::InUse,
            NovaError::PluginRemoved { .. } => ErrorKind::PluginRemoved,
            NovaError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            NovaError::Timeout { .. } => ErrorKind::Timeout,
            NovaError::Cancelled { .. } => ErrorKind::Cancelled,
            NovaError::Upstream { .. } | NovaError::Backend(_) => ErrorKind::Upstream,
            NovaError::NotImplemented { .. } => ErrorKind::NotImplemented,
            NovaError::ValidationError { .. }
            | NovaError::ArchiveError(_)
            | NovaError::ConfigError(_) => ErrorKind::Validation,
            NovaError::StorageError(_) | NovaError::Io(_) => ErrorKind::Storage,
            NovaError::NetworkError(err) if err.is_timeout() => ErrorKind::Timeout,
            NovaError::NetworkError(_) => ErrorKind::BackendUnavailable,
            NovaError::SerializationError(_) => ErrorKind::Upstream,
            NovaError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Transient failures worth retrying; absence and disablement never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::BackendUnavailable | ErrorKind::Timeout
        )
    }

    /// Re-types an error produced while talking to a plugin backend so callers
    /// can tell a plugin problem from a backend process problem. Errors that
    /// already carry a dispatch kind pass through untouched.
    pub(crate) fn into_dispatch(self, plugin_id: &str) -> Self {
        match self {
            NovaError::Backend(message) => NovaError::upstream(plugin_id, message),
            NovaError::SerializationError(err) => NovaError::upstream(plugin_id, err.to_string()),
            NovaError::NetworkError(err) if err.is_timeout() => {
                NovaError::timeout(format!("request to plugin {}", plugin_id), Duration::ZERO)
            }
            NovaError::NetworkError(err) if err.is_connect() => {
                NovaError::backend_unavailable(plugin_id, err.to_string())
            }
            NovaError::NetworkError(err) => NovaError::upstream(plugin_id, err.to_string()),
            NovaError::Io(err) => NovaError::backend_unavailable(plugin_id, err.to_string()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(NovaError::backend_unavailable("a", "down").is_retryable());
        assert!(NovaError::timeout("query_data", Duration::from_secs(1)).is_retryable());
        assert!(!NovaError::plugin_not_found("a").is_retryable());
        assert!(!NovaError::plugin_disabled("a").is_retryable());
    }

    #[test]
    fn backend_errors_become_upstream_with_message_preserved() {
        let err = NovaError::backend("bad query syntax").into_dispatch("ds-a");
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert!(err.to_string().contains("bad query syntax"));
        assert!(err.to_string().contains("ds-a"));
    }

    #[test]
    fn typed_errors_pass_through_dispatch() {
        let err = NovaError::plugin_removed("ds-a").into_dispatch("ds-a");
        assert_eq!(err.kind(), ErrorKind::PluginRemoved);
    }
}

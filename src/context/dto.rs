use serde::{Deserialize, Serialize};

/// Identifies who is calling a plugin and on whose behalf. Sent to backends
/// with every request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PluginContext {
    pub org_id: i64,
    pub plugin_id: String,
    /// Filled in by the dispatcher with the version that served the call.
    #[serde(default)]
    pub plugin_version: String,
    #[serde(default)]
    pub user: Option<User>,
    /// Per-instance settings (app or datasource configuration).
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub login: String,
    #[serde(default)]
    pub role: String,
}

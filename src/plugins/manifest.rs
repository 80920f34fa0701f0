use std::path::Path;

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{NovaError, Result};

use super::dto::{PluginInclude, PluginType};
use super::helpers::validate_plugin_id;

pub const MANIFEST_FILE: &str = "plugin.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    pub name: String,
    #[serde(default)]
    pub info: PluginInfo,
    #[serde(default)]
    pub backend: bool,
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub includes: Vec<PluginInclude>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PluginInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
}

fn manifest_schema() -> Value {
    json!({
        "type": "object",
        "required": ["id", "type", "name"],
        "properties": {
            "id": { "type": "string", "minLength": 1 },
            "type": {
                "type": "string",
                "enum": ["app", "datasource", "panel", "renderer", "secretsmanager"]
            },
            "name": { "type": "string", "minLength": 1 },
            "info": {
                "type": "object",
                "properties": {
                    "version": { "type": "string" },
                    "description": { "type": "string" }
                }
            },
            "backend": { "type": "boolean" },
            "executable": { "type": "string", "minLength": 1 },
            "includes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["type", "name"],
                    "properties": {
                        "type": { "type": "string" },
                        "name": { "type": "string" },
                        "path": { "type": "string" }
                    }
                }
            }
        }
    })
}

pub fn parse_manifest(bytes: &[u8]) -> Result<PluginManifest> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| NovaError::validation_error(format!("plugin.json is not valid JSON: {}", e)))?;

    let schema = manifest_schema();
    let compiled = JSONSchema::compile(&schema)
        .map_err(|e| NovaError::internal(format!("Invalid manifest schema: {}", e)))?;
    if let Err(errors) = compiled.validate(&value) {
        let details = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
        return Err(NovaError::validation_error(format!(
            "Invalid plugin.json: {}",
            details
        )));
    }

    let manifest: PluginManifest = serde_json::from_value(value)?;
    validate_plugin_id(&manifest.id)?;
    if manifest.backend && manifest.executable.as_deref().map_or(false, str::is_empty) {
        return Err(NovaError::validation_error(
            "Backend plugin declares an empty executable",
        ));
    }
    Ok(manifest)
}

pub async fn read_manifest(dir: &Path) -> Result<PluginManifest> {
    let bytes = tokio::fs::read(dir.join(MANIFEST_FILE)).await?;
    parse_manifest(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_datasource_manifest() {
        let manifest = parse_manifest(
            br#"{
                "id": "ds-a",
                "type": "datasource",
                "name": "Datasource A",
                "info": { "version": "1.0.0" },
                "backend": true,
                "executable": "gpx_ds_a",
                "includes": [
                    { "type": "dashboard", "name": "Overview", "path": "dashboards/overview.json" }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.id, "ds-a");
        assert_eq!(manifest.plugin_type, PluginType::Datasource);
        assert_eq!(manifest.info.version, "1.0.0");
        assert_eq!(manifest.includes.len(), 1);
    }

    #[test]
    fn rejects_unknown_type() {
        let err = parse_manifest(br#"{ "id": "x", "type": "widget", "name": "X" }"#).unwrap_err();
        assert!(err.to_string().contains("Invalid plugin.json"));
    }

    #[test]
    fn rejects_missing_name() {
        assert!(parse_manifest(br#"{ "id": "x", "type": "panel" }"#).is_err());
    }
}

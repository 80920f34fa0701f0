use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::PluginContext;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataQuery {
    pub ref_id: String,
    #[serde(default)]
    pub query_type: String,
    #[serde(default)]
    pub max_data_points: i64,
    #[serde(default)]
    pub interval_ms: i64,
    pub time_range: TimeRange,
    /// Plugin-specific query model.
    #[serde(default)]
    pub json: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryDataRequest {
    pub plugin_context: PluginContext,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub queries: Vec<DataQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DataResponse {
    #[serde(default)]
    pub frames: Vec<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

impl DataResponse {
    pub fn frames(frames: Vec<Value>) -> Self {
        Self {
            frames,
            error: None,
            status: Some(200),
        }
    }

    pub fn error(message: impl Into<String>, status: u16) -> Self {
        Self {
            frames: vec![],
            error: Some(message.into()),
            status: Some(status),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Results keyed by query `ref_id`; each entry is a result or an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QueryDataResponse {
    pub responses: BTreeMap<String, DataResponse>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckHealthRequest {
    pub plugin_context: PluginContext,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckHealthResult {
    pub status: HealthStatus,
    pub message: String,
    #[serde(default)]
    pub json_details: Value,
}

impl CheckHealthResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Ok, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Error, message)
    }

    fn with_status(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            json_details: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallResourceRequest {
    pub plugin_context: PluginContext,
    pub method: String,
    /// Path below the plugin's resource root, without a leading slash.
    pub path: String,
    /// Original request URL including the query string.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub body: Vec<u8>,
}

/// One chunk of a resource response. The first chunk carries the status
/// and headers; later chunks only extend the body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CallResourceResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl CallResourceResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn chunk(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 0,
            headers: HashMap::new(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectMetricsRequest {
    pub plugin_context: PluginContext,
}

/// Metrics in Prometheus text exposition format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CollectMetricsResult {
    pub prometheus_metrics: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Ok,
    NotFound,
    PermissionDenied,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscribeStreamRequest {
    pub plugin_context: PluginContext,
    pub path: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscribeStreamResponse {
    pub status: StreamStatus,
    #[serde(default)]
    pub initial_data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishStreamRequest {
    pub plugin_context: PluginContext,
    pub path: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishStreamResponse {
    pub status: StreamStatus,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunStreamRequest {
    pub plugin_context: PluginContext,
    pub path: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamPacket {
    pub data: Value,
}

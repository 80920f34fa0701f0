use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::PluginContext;
use crate::error::{NovaError, Result};

use super::{
    BackendPlugin, CallResourceRequest, CallResourceResponse, CheckHealthRequest,
    CheckHealthResult, CollectMetricsRequest, CollectMetricsResult, PublishStreamRequest,
    PublishStreamResponse, QueryDataRequest, QueryDataResponse, ResourceStream,
    RunStreamRequest, StreamPacket, StreamSender, SubscribeStreamRequest,
    SubscribeStreamResponse,
};

pub const PLUGIN_CONTEXT_HEADER: &str = "x-nova-plugin-context";

/// Backend reached over loopback HTTP with JSON bodies.
///
/// Routes: `POST /query`, `POST /health`, `{METHOD} /resources/{path}`,
/// `POST /metrics`, `POST /stream/subscribe`, `POST /stream/publish` and
/// `POST /stream/run` (newline-delimited JSON packets).
#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .user_agent("Nova-Plugins/0.1.0")
            .build()
            .unwrap_or_else(|e| {
                tracing::error!("Failed to build HTTP client: {}", e);
                Client::new()
            });
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post_json<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        let response = check_status(response).await?;
        Ok(response.json::<Resp>().await?)
    }
}

/// Non-2xx answers carry the plugin's own error text.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => map
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(text),
        _ => text,
    };
    Err(NovaError::backend(format!("{}: {}", status.as_u16(), message)))
}

fn header_values(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    out
}

fn context_header(context: &PluginContext) -> Result<String> {
    Ok(serde_json::to_string(context)?)
}

#[async_trait]
impl BackendPlugin for HttpBackend {
    async fn query_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        self.post_json("query", &req).await
    }

    async fn check_health(&self, req: CheckHealthRequest) -> Result<CheckHealthResult> {
        self.post_json("health", &req).await
    }

    async fn call_resource(&self, req: CallResourceRequest) -> Result<ResourceStream> {
        let method = Method::from_bytes(req.method.to_uppercase().as_bytes())
            .map_err(|_| NovaError::validation_error(format!("Invalid method: {}", req.method)))?;
        let mut url = self.url(&format!("resources/{}", req.path.trim_start_matches('/')));
        if let Some((_, query)) = req.url.split_once('?') {
            url.push('?');
            url.push_str(query);
        }

        let mut builder = self
            .http
            .request(method, url)
            .header(PLUGIN_CONTEXT_HEADER, context_header(&req.plugin_context)?);
        for (name, values) in &req.headers {
            for value in values {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        if !req.body.is_empty() {
            builder = builder.body(req.body);
        }

        let response = builder.send().await?;
        let head = CallResourceResponse {
            status: response.status().as_u16(),
            headers: header_values(response.headers()),
            body: Vec::new(),
        };
        debug!(status = head.status, "Resource response started");

        // Dropping the stream drops the response, which aborts the request.
        let body = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| CallResourceResponse::chunk(bytes.to_vec()))
                .map_err(NovaError::from)
        });
        Ok(futures::stream::once(async move { Ok(head) })
            .chain(body)
            .boxed())
    }

    async fn collect_metrics(&self, req: CollectMetricsRequest) -> Result<CollectMetricsResult> {
        let response = self
            .http
            .post(self.url("metrics"))
            .json(&req)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(CollectMetricsResult {
            prometheus_metrics: response.bytes().await?.to_vec(),
        })
    }

    async fn subscribe_stream(&self, req: SubscribeStreamRequest) -> Result<SubscribeStreamResponse> {
        self.post_json("stream/subscribe", &req).await
    }

    async fn publish_stream(&self, req: PublishStreamRequest) -> Result<PublishStreamResponse> {
        self.post_json("stream/publish", &req).await
    }

    async fn run_stream(
        &self,
        req: RunStreamRequest,
        sender: StreamSender,
        cancel: CancellationToken,
    ) -> Result<()> {
        let response = self
            .http
            .post(self.url("stream/run"))
            .json(&req)
            .send()
            .await?;
        let mut body = Box::pin(check_status(response).await?.bytes_stream());

        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            buffer.extend_from_slice(&chunk?);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(packet) = parse_packet(&line)? {
                    sender.send(packet).await?;
                }
            }
        }
        if let Some(packet) = parse_packet(&buffer)? {
            sender.send(packet).await?;
        }
        Ok(())
    }
}

fn parse_packet(line: &[u8]) -> Result<Option<StreamPacket>> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let data: Value = serde_json::from_str(trimmed)?;
    Ok(Some(StreamPacket { data }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ndjson_lines() {
        assert!(parse_packet(b"  \n").unwrap().is_none());
        let packet = parse_packet(b"{\"tick\":1}\n").unwrap().unwrap();
        assert_eq!(packet.data["tick"], 1);
        assert!(parse_packet(b"not json\n").is_err());
    }

    #[test]
    fn base_url_is_normalized() {
        let backend = HttpBackend::new("http://127.0.0.1:4000/");
        assert_eq!(backend.url("/query"), "http://127.0.0.1:4000/query");
    }
}

mod handles;
mod stream;

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::backend::{
    BackendFactoryProvider, BackendPlugin, CallResourceRequest, CheckHealthRequest,
    CheckHealthResult, CollectMetricsRequest, CollectMetricsResult, DataQuery, DataResponse,
    PublishStreamRequest, PublishStreamResponse, QueryDataRequest, QueryDataResponse,
    RunStreamRequest, StreamSender, SubscribeStreamRequest, SubscribeStreamResponse,
};
use crate::context::{CallContext, PluginContext};
use crate::error::{ErrorKind, NovaError, Result};
use crate::plugins::{PluginDto, PluginRegistry};

pub use handles::{BackendHandle, CloseReason, HandleTable, InFlightGuard};
pub use stream::{PluginStream, ResourceResponseStream, StreamEnd, StreamEvent};

const RESOLVE_ATTEMPTS: usize = 3;
const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_BUFFER: usize = 16;

/// Routes operations to plugin backends.
///
/// Every call re-reads the registry, so a removal or upgrade is observed by
/// the next call. Backends are started lazily and shared per plugin.
pub struct PluginClient {
    registry: Arc<PluginRegistry>,
    provider: Arc<dyn BackendFactoryProvider>,
    handles: HandleTable,
    health_check_timeout: Duration,
    request_timeout: Duration,
}

impl PluginClient {
    pub fn new(
        registry: Arc<PluginRegistry>,
        provider: Arc<dyn BackendFactoryProvider>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            provider,
            handles: HandleTable::new(shutdown_timeout),
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Upper bound for request/response calls whose context has no tighter
    /// deadline. Streams are not bounded by it.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Detaches the plugin's backend; in-flight calls drain in the background.
    pub fn retire(&self, plugin_id: &str, reason: CloseReason) {
        self.handles.retire(plugin_id, reason);
    }

    /// Shuts the plugin's backend down before it is removed.
    pub async fn shutdown_backend(&self, plugin_id: &str, timeout: Duration) -> Result<()> {
        self.handles
            .shutdown(plugin_id, CloseReason::Removed, timeout)
            .await
    }

    pub async fn shutdown_all(&self, timeout: Duration) {
        self.handles.shutdown_all(timeout).await
    }

    async fn resolve(&self, ctx: &CallContext, plugin_id: &str) -> Result<(PluginDto, InFlightGuard)> {
        for attempt in 1..=RESOLVE_ATTEMPTS {
            let plugin = self.dispatchable(plugin_id)?;
            let factory = self.provider.backend_factory(&plugin).ok_or_else(|| {
                NovaError::backend_unavailable(plugin_id, "plugin has no backend")
            })?;

            let handle = ctx
                .run("start backend", self.handles.try_acquire(&plugin, factory))
                .await?;
            let Some(guard) = handle.as_ref().and_then(|handle| handle.enter()) else {
                debug!(plugin_id, attempt, "Backend handle was stale, resolving again");
                continue;
            };

            // a removal that ran before the slot existed had nothing to shut down
            match self.dispatchable(plugin_id) {
                Ok(current) if current.version == plugin.version => return Ok((plugin, guard)),
                Ok(_) => {
                    let handle = guard.handle().clone();
                    drop(guard);
                    self.handles.discard(&handle, CloseReason::Superseded);
                    debug!(plugin_id, attempt, "Plugin changed while resolving, resolving again");
                }
                Err(err) => {
                    let handle = guard.handle().clone();
                    drop(guard);
                    let reason = match err.kind() {
                        ErrorKind::Disabled => CloseReason::Disabled,
                        _ => CloseReason::Removed,
                    };
                    self.handles.discard(&handle, reason);
                    return Err(err);
                }
            }
        }
        Err(NovaError::backend_unavailable(
            plugin_id,
            "backend kept changing while resolving",
        ))
    }

    /// Current catalog entry for `plugin_id`, if calls may be routed to it.
    fn dispatchable(&self, plugin_id: &str) -> Result<PluginDto> {
        match self.registry.get(plugin_id) {
            None => Err(NovaError::plugin_not_found(plugin_id)),
            Some(plugin) if plugin.decommissioned => Err(NovaError::plugin_removed(plugin_id)),
            Some(plugin) if !plugin.enabled => Err(NovaError::plugin_disabled(plugin_id)),
            Some(plugin) => Ok(PluginDto::from(plugin.as_ref())),
        }
    }

    /// Runs one request/response operation against the plugin's backend.
    async fn invoke<T, F, Fut>(
        &self,
        ctx: &CallContext,
        plugin_id: &str,
        operation: &'static str,
        call: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<dyn BackendPlugin>, PluginDto) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ctx = &ctx.clone().with_timeout(self.request_timeout);
        let (plugin, guard) = self.resolve(ctx, plugin_id).await?;
        let handle = guard.handle().clone();
        let outcome = tokio::select! {
            biased;
            err = ctx.done(operation) => Some(Err(err)),
            _ = handle.aborted() => None,
            result = call(handle.backend(), plugin) => Some(result.map_err(|err| err.into_dispatch(plugin_id))),
        };
        drop(guard);
        let result = match outcome {
            Some(result) => result,
            None => Err(handle.interrupted_error().await),
        };

        match &result {
            Ok(_) => debug!(plugin_id, operation, generation = handle.generation(), "Dispatch ok"),
            Err(err) => debug!(plugin_id, operation, kind = ?err.kind(), "Dispatch failed: {}", err),
        }
        result
    }

    /// Runs a batch of queries. Malformed queries and queries the backend did
    /// not answer get per-query errors while the others still succeed. A
    /// repeated `ref_id` keeps its first query.
    pub async fn query_data(&self, ctx: &CallContext, req: QueryDataRequest) -> Result<QueryDataResponse> {
        let plugin_id = req.plugin_context.plugin_id.clone();
        let QueryDataRequest {
            plugin_context,
            headers,
            queries,
        } = req;

        let mut responses = BTreeMap::new();
        let mut seen = HashSet::new();
        let mut valid = Vec::new();
        for query in queries {
            if !seen.insert(query.ref_id.clone()) {
                warn!(plugin_id = %plugin_id, ref_id = %query.ref_id, "Dropping duplicate query");
                continue;
            }
            match validate_query(&query) {
                Ok(()) => valid.push(query),
                Err(message) => {
                    responses.insert(query.ref_id.clone(), DataResponse::error(message, 400));
                }
            }
        }

        if valid.is_empty() {
            // still surface NotFound / Disabled for the plugin itself
            self.registry_check(&plugin_id)?;
            return Ok(QueryDataResponse { responses });
        }

        let expected: Vec<String> = valid.iter().map(|query| query.ref_id.clone()).collect();
        let forwarded = QueryDataRequest {
            plugin_context,
            headers,
            queries: valid,
        };
        let mut answered = self
            .invoke(ctx, &plugin_id, "query_data", |backend, plugin| {
                let mut forwarded = forwarded;
                stamp_version(&mut forwarded.plugin_context, &plugin);
                async move { backend.query_data(forwarded).await }
            })
            .await?;

        for ref_id in expected {
            let response = answered
                .responses
                .remove(&ref_id)
                .unwrap_or_else(|| DataResponse::error("No response from plugin for query", 500));
            responses.insert(ref_id, response);
        }
        Ok(QueryDataResponse { responses })
    }

    fn registry_check(&self, plugin_id: &str) -> Result<()> {
        match self.registry.get(plugin_id) {
            None => Err(NovaError::plugin_not_found(plugin_id)),
            Some(plugin) if plugin.decommissioned => Err(NovaError::plugin_removed(plugin_id)),
            Some(plugin) if !plugin.enabled => Err(NovaError::plugin_disabled(plugin_id)),
            Some(_) => Ok(()),
        }
    }

    /// A health check that overruns its timeout reports `Error` status.
    pub async fn check_health(&self, ctx: &CallContext, req: CheckHealthRequest) -> Result<CheckHealthResult> {
        let plugin_id = req.plugin_context.plugin_id.clone();
        let bounded = ctx.child().with_timeout(self.health_check_timeout);
        let result = self
            .invoke(&bounded, &plugin_id, "check_health", |backend, plugin| {
                let mut req = req;
                stamp_version(&mut req.plugin_context, &plugin);
                async move { backend.check_health(req).await }
            })
            .await;

        match result {
            Err(err) if err.kind() == ErrorKind::Timeout && !ctx.is_cancelled() => {
                warn!(plugin_id = %plugin_id, "Health check timed out");
                Ok(CheckHealthResult::error(format!(
                    "Health check timed out after {:?}",
                    self.health_check_timeout
                )))
            }
            other => other,
        }
    }

    /// Forwards a resource call. Chunks arrive as the backend produces them;
    /// dropping the stream or cancelling `ctx` aborts the backend call.
    pub async fn call_resource(&self, ctx: &CallContext, mut req: CallResourceRequest) -> Result<ResourceResponseStream> {
        let plugin_id = req.plugin_context.plugin_id.clone();
        let (plugin, guard) = self.resolve(ctx, &plugin_id).await?;
        stamp_version(&mut req.plugin_context, &plugin);
        let handle = guard.handle().clone();

        let bounded = ctx.clone().with_timeout(self.request_timeout);
        let backend = handle.backend();
        let started = tokio::select! {
            biased;
            err = bounded.done("call_resource") => Some(Err(err)),
            _ = handle.aborted() => None,
            result = backend.call_resource(req) => Some(result.map_err(|err| err.into_dispatch(&plugin_id))),
        };
        let Some(started) = started else {
            drop(guard);
            return Err(handle.interrupted_error().await);
        };
        let mut upstream = started?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            // holding the guard keeps the handle busy until the body is done
            let mut guard = Some(guard);
            loop {
                let next = tokio::select! {
                    biased;
                    err = ctx.done("call_resource") => Some(Err(err)),
                    _ = handle.aborted() => {
                        drop(guard.take());
                        Some(Err(handle.interrupted_error().await))
                    }
                    _ = tx.closed() => {
                        debug!(plugin_id = %plugin_id, "Resource stream dropped by caller");
                        return;
                    }
                    chunk = upstream.next() => chunk.map(|chunk| chunk.map_err(|err| err.into_dispatch(&plugin_id))),
                };
                match next {
                    Some(Ok(chunk)) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                    None => return,
                }
            }
        });
        Ok(ResourceResponseStream::new(rx))
    }

    pub async fn collect_metrics(&self, ctx: &CallContext, req: CollectMetricsRequest) -> Result<CollectMetricsResult> {
        let plugin_id = req.plugin_context.plugin_id.clone();
        self.invoke(ctx, &plugin_id, "collect_metrics", |backend, plugin| {
            let mut req = req;
            stamp_version(&mut req.plugin_context, &plugin);
            async move { backend.collect_metrics(req).await }
        })
        .await
    }

    pub async fn subscribe_stream(&self, ctx: &CallContext, req: SubscribeStreamRequest) -> Result<SubscribeStreamResponse> {
        let plugin_id = req.plugin_context.plugin_id.clone();
        self.invoke(ctx, &plugin_id, "subscribe_stream", |backend, plugin| {
            let mut req = req;
            stamp_version(&mut req.plugin_context, &plugin);
            async move { backend.subscribe_stream(req).await }
        })
        .await
    }

    pub async fn publish_stream(&self, ctx: &CallContext, req: PublishStreamRequest) -> Result<PublishStreamResponse> {
        let plugin_id = req.plugin_context.plugin_id.clone();
        self.invoke(ctx, &plugin_id, "publish_stream", |backend, plugin| {
            let mut req = req;
            stamp_version(&mut req.plugin_context, &plugin);
            async move { backend.publish_stream(req).await }
        })
        .await
    }

    /// Opens a long-lived stream. Errors resolving the plugin are returned
    /// directly; everything after that is reported as the stream's end.
    pub async fn run_stream(&self, ctx: &CallContext, mut req: RunStreamRequest) -> Result<PluginStream> {
        let plugin_id = req.plugin_context.plugin_id.clone();
        let (plugin, guard) = self.resolve(ctx, &plugin_id).await?;
        stamp_version(&mut req.plugin_context, &plugin);
        let handle = guard.handle().clone();

        let (packet_tx, packet_rx) = mpsc::channel(STREAM_BUFFER);
        let (end_tx, end_rx) = oneshot::channel();
        let cancel = ctx.token().child_token();
        let stream = PluginStream::new(packet_rx, end_rx, cancel.clone());

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut guard = Some(guard);
            let backend = handle.backend();
            let sender = StreamSender::new(packet_tx);
            let end = tokio::select! {
                biased;
                _ = cancel.cancelled() => StreamEnd::Cancelled,
                err = ctx.done("run_stream") => match err.kind() {
                    ErrorKind::Timeout => StreamEnd::Error(err.to_string()),
                    _ => StreamEnd::Cancelled,
                },
                // long-lived streams do not wait for the drain
                _ = handle.closing() => {
                    drop(guard.take());
                    handle.removal_settled().await;
                    match handle.close_reason() {
                        Some(CloseReason::Removed) if handle.removal_rolled_back() => StreamEnd::Restarted,
                        Some(CloseReason::Removed) => StreamEnd::PluginRemoved,
                        Some(CloseReason::Exited) => StreamEnd::BackendExited,
                        Some(CloseReason::Superseded) => StreamEnd::Restarted,
                        Some(CloseReason::Shutdown) => StreamEnd::Cancelled,
                        _ => StreamEnd::Error(handle.closed_error().to_string()),
                    }
                }
                result = backend.run_stream(req, sender, cancel.clone()) => match result {
                    Ok(()) if cancel.is_cancelled() => StreamEnd::Cancelled,
                    Ok(()) => StreamEnd::Completed,
                    Err(err) if err.kind() == ErrorKind::Cancelled => StreamEnd::Cancelled,
                    Err(err) => StreamEnd::Error(err.into_dispatch(&plugin_id).to_string()),
                },
            };
            cancel.cancel();
            debug!(plugin_id = %plugin_id, ?end, "Stream ended");
            let _ = end_tx.send(end);
        });
        Ok(stream)
    }
}

fn stamp_version(context: &mut PluginContext, plugin: &PluginDto) {
    context.plugin_version = plugin.version.clone();
}

/// Checks the parts of a query the host can judge without the plugin.
fn validate_query(query: &DataQuery) -> std::result::Result<(), String> {
    if query.ref_id.trim().is_empty() {
        return Err("Query is missing a refId".to_string());
    }
    if query.time_range.from > query.time_range.to {
        return Err("Time range starts after it ends".to_string());
    }
    if query.max_data_points < 0 {
        return Err("maxDataPoints must not be negative".to_string());
    }
    if query.interval_ms < 0 {
        return Err("interval must not be negative".to_string());
    }
    if !query.json.is_object() && !query.json.is_null() {
        return Err("Query model must be a JSON object".to_string());
    }
    Ok(())
}

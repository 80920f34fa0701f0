pub mod dto;
pub mod factory;
pub mod http;
pub mod process;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{NovaError, Result};

pub use dto::{
    CallResourceRequest, CallResourceResponse, CheckHealthRequest, CheckHealthResult,
    CollectMetricsRequest, CollectMetricsResult, DataQuery, DataResponse, HealthStatus,
    PublishStreamRequest, PublishStreamResponse, QueryDataRequest, QueryDataResponse,
    RunStreamRequest, StreamPacket, StreamStatus, SubscribeStreamRequest,
    SubscribeStreamResponse, TimeRange,
};
pub use factory::{BackendFactoryFn, BackendFactoryProvider, DefaultBackendProvider};
pub use http::HttpBackend;
pub use process::{Handshake, ProcessBackend};

/// Incrementally delivered resource response.
pub type ResourceStream = BoxStream<'static, Result<CallResourceResponse>>;

/// A plugin's backend implementation, in process or behind a transport.
///
/// Every handler defaults to `NotImplemented`, so a backend only overrides
/// what it supports.
#[async_trait]
pub trait BackendPlugin: Send + Sync {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Resolves when the backend went away on its own (process exit).
    async fn exited(&self) {
        futures::future::pending::<()>().await
    }

    async fn query_data(&self, _req: QueryDataRequest) -> Result<QueryDataResponse> {
        Err(NovaError::not_implemented("query_data"))
    }

    async fn check_health(&self, _req: CheckHealthRequest) -> Result<CheckHealthResult> {
        Err(NovaError::not_implemented("check_health"))
    }

    async fn call_resource(&self, _req: CallResourceRequest) -> Result<ResourceStream> {
        Err(NovaError::not_implemented("call_resource"))
    }

    async fn collect_metrics(&self, _req: CollectMetricsRequest) -> Result<CollectMetricsResult> {
        Err(NovaError::not_implemented("collect_metrics"))
    }

    async fn subscribe_stream(
        &self,
        _req: SubscribeStreamRequest,
    ) -> Result<SubscribeStreamResponse> {
        Err(NovaError::not_implemented("subscribe_stream"))
    }

    async fn publish_stream(&self, _req: PublishStreamRequest) -> Result<PublishStreamResponse> {
        Err(NovaError::not_implemented("publish_stream"))
    }

    /// Pushes packets through `sender` until done or `cancel` fires.
    async fn run_stream(
        &self,
        _req: RunStreamRequest,
        _sender: StreamSender,
        _cancel: CancellationToken,
    ) -> Result<()> {
        Err(NovaError::not_implemented("run_stream"))
    }
}

/// Backend side of a running stream.
#[derive(Debug, Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<StreamPacket>,
}

impl StreamSender {
    pub fn new(tx: mpsc::Sender<StreamPacket>) -> Self {
        Self { tx }
    }

    /// Fails with `Cancelled` once the subscriber is gone.
    pub async fn send(&self, packet: StreamPacket) -> Result<()> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| NovaError::cancelled("stream send"))
    }

    pub async fn send_json(&self, data: serde_json::Value) -> Result<()> {
        self.send(StreamPacket { data }).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::backend::{CallResourceResponse, StreamPacket};
use crate::error::Result;

/// Incremental resource response. Dropping it aborts the backend call.
pub struct ResourceResponseStream {
    inner: ReceiverStream<Result<CallResourceResponse>>,
}

impl ResourceResponseStream {
    pub(crate) fn new(rx: mpsc::Receiver<Result<CallResourceResponse>>) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
        }
    }

    /// Folds every chunk into one response.
    pub async fn collect_body(mut self) -> Result<CallResourceResponse> {
        let mut response = CallResourceResponse::default();
        let mut first = true;
        while let Some(chunk) = self.inner.next().await {
            let chunk = chunk?;
            if first {
                response.status = chunk.status;
                response.headers = chunk.headers;
                first = false;
            }
            response.body.extend_from_slice(&chunk.body);
        }
        Ok(response)
    }
}

impl Stream for ResourceResponseStream {
    type Item = Result<CallResourceResponse>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// How a [`PluginStream`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The backend finished the stream.
    Completed,
    /// The subscriber or its context cancelled.
    Cancelled,
    PluginRemoved,
    BackendExited,
    /// The plugin was upgraded; subscribe again to reach the new version.
    Restarted,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Packet(StreamPacket),
    End(StreamEnd),
}

/// Subscriber side of `run_stream`. Yields packets and then exactly one
/// [`StreamEvent::End`]; dropping it cancels the stream.
pub struct PluginStream {
    packets: mpsc::Receiver<StreamPacket>,
    end: oneshot::Receiver<StreamEnd>,
    cancel: CancellationToken,
    finished: bool,
}

impl PluginStream {
    pub(crate) fn new(
        packets: mpsc::Receiver<StreamPacket>,
        end: oneshot::Receiver<StreamEnd>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            packets,
            end,
            cancel,
            finished: false,
        }
    }

    /// Next event, or `None` after the end was delivered.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = tokio::select! {
            biased;
            Some(packet) = self.packets.recv() => StreamEvent::Packet(packet),
            end = &mut self.end => {
                self.finished = true;
                StreamEvent::End(end.unwrap_or_else(|_| {
                    StreamEnd::Error("stream task ended without a result".to_string())
                }))
            }
        };
        Some(event)
    }

    /// Reads until the end event and returns it, dropping packets.
    pub async fn wait_end(&mut self) -> Option<StreamEnd> {
        while let Some(event) = self.next().await {
            if let StreamEvent::End(end) = event {
                return Some(end);
            }
        }
        None
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PluginStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

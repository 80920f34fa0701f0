use std::net::SocketAddr;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{NovaError, Result};
use crate::plugins::PluginDto;

use super::http::HttpBackend;
use super::{
    BackendPlugin, CallResourceRequest, CheckHealthRequest, CheckHealthResult,
    CollectMetricsRequest, CollectMetricsResult, PublishStreamRequest, PublishStreamResponse,
    QueryDataRequest, QueryDataResponse, ResourceStream, RunStreamRequest, StreamSender,
    SubscribeStreamRequest, SubscribeStreamResponse,
};

pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// First line a plugin executable prints on stdout:
/// `CORE-VERSION|APP-VERSION|tcp|ADDR|http`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub core_version: u32,
    pub app_version: u32,
    pub addr: SocketAddr,
}

impl FromStr for Handshake {
    type Err = NovaError;

    fn from_str(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.trim().split('|').collect();
        let [core, app, network, addr, protocol] = parts.as_slice() else {
            return Err(NovaError::validation_error(format!(
                "Malformed handshake: {}",
                line.trim()
            )));
        };
        let core_version: u32 = core
            .parse()
            .map_err(|_| NovaError::validation_error(format!("Bad core version: {}", core)))?;
        if core_version != CORE_PROTOCOL_VERSION {
            return Err(NovaError::validation_error(format!(
                "Unsupported core protocol version {}",
                core_version
            )));
        }
        let app_version: u32 = app
            .parse()
            .map_err(|_| NovaError::validation_error(format!("Bad app version: {}", app)))?;
        if *network != "tcp" {
            return Err(NovaError::validation_error(format!(
                "Unsupported network type: {}",
                network
            )));
        }
        if *protocol != "http" {
            return Err(NovaError::validation_error(format!(
                "Unsupported protocol: {}",
                protocol
            )));
        }
        let addr = addr
            .parse()
            .map_err(|_| NovaError::validation_error(format!("Bad address: {}", addr)))?;
        Ok(Self {
            core_version,
            app_version,
            addr,
        })
    }
}

/// Plugin executable started as a child process and reached over HTTP.
pub struct ProcessBackend {
    plugin_id: String,
    inner: HttpBackend,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    exited: watch::Receiver<bool>,
}

impl ProcessBackend {
    /// Spawns the plugin's executable and waits for its handshake line.
    pub async fn launch(plugin: &PluginDto, start_timeout: Duration) -> Result<Self> {
        let executable = plugin
            .executable
            .as_deref()
            .ok_or_else(|| NovaError::backend_unavailable(&plugin.id, "no executable"))?;
        let path = plugin.dir.join(executable);

        let mut command = Command::new(&path);
        command
            .current_dir(&plugin.dir)
            .env("NOVA_PLUGIN_ID", &plugin.id)
            .env("NOVA_PLUGIN_VERSION", &plugin.version)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            NovaError::backend_unavailable(
                &plugin.id,
                format!("failed to spawn {}: {}", path.display(), e),
            )
        })?;
        debug!(plugin_id = %plugin.id, pid = ?child.id(), "Backend process spawned");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| NovaError::backend_unavailable(&plugin.id, "stdout unavailable"))?;
        if let Some(stderr) = child.stderr.take() {
            let plugin_id = plugin.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(plugin_id = %plugin_id, "[stderr] {}", line);
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        let handshake = tokio::time::timeout(start_timeout, async {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match line.parse::<Handshake>() {
                        Ok(handshake) => return Ok(handshake),
                        Err(_) => debug!(plugin_id = %plugin.id, "[stdout] {}", line),
                    },
                    Ok(None) => {
                        return Err(NovaError::backend_unavailable(
                            &plugin.id,
                            "process exited before handshake",
                        ))
                    }
                    Err(err) => return Err(NovaError::backend_unavailable(&plugin.id, err.to_string())),
                }
            }
        })
        .await
        .map_err(|_| {
            NovaError::backend_unavailable(
                &plugin.id,
                format!("no handshake within {:?}", start_timeout),
            )
        })??;

        info!(
            plugin_id = %plugin.id,
            addr = %handshake.addr,
            app_version = handshake.app_version,
            "Backend process started"
        );

        let plugin_id = plugin.id.clone();
        tokio::spawn({
            let plugin_id = plugin_id.clone();
            async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(plugin_id = %plugin_id, "[stdout] {}", line);
                }
            }
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        tokio::spawn(supervise(plugin_id.clone(), child, kill_rx, exited_tx));

        Ok(Self {
            plugin_id,
            inner: HttpBackend::new(format!("http://{}", handshake.addr)),
            kill: Mutex::new(Some(kill_tx)),
            exited: exited_rx,
        })
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }
}

/// Owns the child until it exits on its own or a kill is requested.
async fn supervise(
    plugin_id: String,
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exited: watch::Sender<bool>,
) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => warn!(plugin_id = %plugin_id, ?status, "Backend process exited"),
            Err(err) => warn!(plugin_id = %plugin_id, "Failed to wait on backend process: {}", err),
        },
        _ = kill => {
            if let Err(err) = child.kill().await {
                warn!(plugin_id = %plugin_id, "Failed to kill backend process: {}", err);
            }
            debug!(plugin_id = %plugin_id, "Backend process stopped");
        }
    }
    let _ = exited.send(true);
}

#[async_trait]
impl BackendPlugin for ProcessBackend {
    async fn stop(&self) -> Result<()> {
        if let Some(kill) = self.kill.lock().await.take() {
            let _ = kill.send(());
        }
        self.exited().await;
        Ok(())
    }

    async fn exited(&self) {
        let mut exited = self.exited.clone();
        // a closed channel means the supervisor is gone as well
        let _ = exited.wait_for(|done| *done).await;
    }

    async fn query_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        self.inner.query_data(req).await
    }

    async fn check_health(&self, req: CheckHealthRequest) -> Result<CheckHealthResult> {
        self.inner.check_health(req).await
    }

    async fn call_resource(&self, req: CallResourceRequest) -> Result<ResourceStream> {
        self.inner.call_resource(req).await
    }

    async fn collect_metrics(&self, req: CollectMetricsRequest) -> Result<CollectMetricsResult> {
        self.inner.collect_metrics(req).await
    }

    async fn subscribe_stream(&self, req: SubscribeStreamRequest) -> Result<SubscribeStreamResponse> {
        self.inner.subscribe_stream(req).await
    }

    async fn publish_stream(&self, req: PublishStreamRequest) -> Result<PublishStreamResponse> {
        self.inner.publish_stream(req).await
    }

    async fn run_stream(
        &self,
        req: RunStreamRequest,
        sender: StreamSender,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.inner.run_stream(req, sender, cancel).await
    }
}

impl std::fmt::Debug for ProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessBackend")
            .field("plugin_id", &self.plugin_id)
            .field("base_url", &self.inner.base_url())
            .finish()
    }
}

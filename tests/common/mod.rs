#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use nova_plugins::backend::{
    BackendFactoryFn, BackendFactoryProvider, BackendPlugin, CallResourceRequest, CallResourceResponse,
    CheckHealthRequest, CheckHealthResult, CollectMetricsRequest, CollectMetricsResult,
    DataQuery, DataResponse, DefaultBackendProvider, QueryDataRequest, QueryDataResponse,
    ResourceStream, RunStreamRequest, StreamSender, TimeRange,
};
use nova_plugins::context::PluginContext;
use nova_plugins::plugins::{
    InstallLedger, PluginClass, PluginDto, PluginSource, UpdateInfo, UpdateSource,
};
use nova_plugins::{NovaConfig, NovaError, PluginHost, Result};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub fn manifest(id: &str, plugin_type: &str, version: &str, backend: bool) -> String {
    json!({
        "id": id,
        "type": plugin_type,
        "name": id,
        "info": { "version": version },
        "backend": backend,
    })
    .to_string()
}

pub fn zip_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in files {
        writer
            .start_file(*name, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Archive wrapped in a top-level folder, the way plugin zips usually ship.
pub fn plugin_archive(id: &str, version: &str) -> Vec<u8> {
    zip_archive(&[(
        &format!("{}/plugin.json", id),
        &manifest(id, "datasource", version, true),
    )])
}

pub fn write_plugin_dir(root: &Path, id: &str, manifest_json: &str) -> PathBuf {
    let dir = root.join(id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("plugin.json"), manifest_json).unwrap();
    dir
}

/// Update source serving archives from memory.
#[derive(Default)]
pub struct StaticUpdateSource {
    archives: Mutex<HashMap<(String, String), Vec<u8>>>,
    downloads: AtomicUsize,
}

impl StaticUpdateSource {
    pub fn publish(&self, id: &str, version: &str, archive: Vec<u8>) {
        self.archives
            .lock()
            .unwrap()
            .insert((id.to_string(), version.to_string()), archive);
    }

    pub fn publish_plugin(&self, id: &str, version: &str) {
        self.publish(id, version, plugin_archive(id, version));
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpdateSource for StaticUpdateSource {
    async fn update_info(&self, plugin_id: &str, version: &str) -> Result<UpdateInfo> {
        let key = (plugin_id.to_string(), version.to_string());
        if !self.archives.lock().unwrap().contains_key(&key) {
            return Err(NovaError::version_not_found(plugin_id, version));
        }
        Ok(UpdateInfo {
            plugin_zip_url: format!("mem://{}/{}", plugin_id, version),
        })
    }

    async fn download(&self, plugin_id: &str, version: &str, _info: &UpdateInfo) -> Result<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.archives
            .lock()
            .unwrap()
            .get(&(plugin_id.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| NovaError::version_not_found(plugin_id, version))
    }
}

/// Knobs shared by every backend a [`TestHost`] creates for one plugin.
#[derive(Default)]
pub struct BackendProbe {
    pub created: AtomicUsize,
    pub stopped: AtomicUsize,
    pub open_resources: Arc<AtomicUsize>,
    pub health_delay: Mutex<Duration>,
    pub stop_delay: Mutex<Duration>,
    pub query_delay: Mutex<Duration>,
    pub create_delay: Mutex<Duration>,
    /// Cancelling makes the current backend report that it exited.
    pub exit: Mutex<CancellationToken>,
}

impl BackendProbe {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn open_resources(&self) -> usize {
        self.open_resources.load(Ordering::SeqCst)
    }

    pub fn set_health_delay(&self, delay: Duration) {
        *self.health_delay.lock().unwrap() = delay;
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock().unwrap() = delay;
    }

    pub fn set_query_delay(&self, delay: Duration) {
        *self.query_delay.lock().unwrap() = delay;
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn crash(&self) {
        let mut exit = self.exit.lock().unwrap();
        exit.cancel();
        *exit = CancellationToken::new();
    }
}

/// In-process backend that answers from its plugin version.
pub struct TestBackend {
    version: String,
    probe: Arc<BackendProbe>,
    exit: CancellationToken,
}

impl TestBackend {
    fn delay(slot: &Mutex<Duration>) -> Duration {
        *slot.lock().unwrap()
    }
}

struct ResourceGuard(Arc<AtomicUsize>);

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendPlugin for TestBackend {
    async fn stop(&self) -> Result<()> {
        tokio::time::sleep(Self::delay(&self.probe.stop_delay)).await;
        self.probe.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exited(&self) {
        self.exit.cancelled().await
    }

    async fn query_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        tokio::time::sleep(Self::delay(&self.probe.query_delay)).await;
        let mut response = QueryDataResponse::default();
        let served_as = req.plugin_context.plugin_version.clone();
        for query in req.queries {
            if query.json.get("explode").is_some() {
                return Err(NovaError::backend("bad query syntax"));
            }
            if query.json.get("skip").is_some() {
                continue;
            }
            response.responses.insert(
                query.ref_id.clone(),
                DataResponse::frames(vec![json!({
                    "refId": query.ref_id,
                    "version": self.version,
                    "contextVersion": served_as,
                })]),
            );
        }
        Ok(response)
    }

    async fn check_health(&self, _req: CheckHealthRequest) -> Result<CheckHealthResult> {
        tokio::time::sleep(Self::delay(&self.probe.health_delay)).await;
        Ok(CheckHealthResult::ok(format!("version {}", self.version)))
    }

    async fn call_resource(&self, req: CallResourceRequest) -> Result<ResourceStream> {
        let open = self.probe.open_resources.clone();
        open.fetch_add(1, Ordering::SeqCst);
        let guard = ResourceGuard(open);
        let endless = req.path == "endless";

        let head = futures::stream::once(async move {
            Ok::<_, NovaError>(CallResourceResponse::new(200, format!("path={};", req.path)))
        });
        let body = futures::stream::unfold((0usize, guard), move |(n, guard)| async move {
            if !endless && n >= 3 {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            Some((
                Ok(CallResourceResponse::chunk(format!("chunk-{};", n))),
                (n + 1, guard),
            ))
        });
        Ok(futures::StreamExt::boxed(futures::StreamExt::chain(head, body)))
    }

    async fn collect_metrics(&self, _req: CollectMetricsRequest) -> Result<CollectMetricsResult> {
        Ok(CollectMetricsResult {
            prometheus_metrics: b"# TYPE up gauge\nup 1\n".to_vec(),
        })
    }

    async fn run_stream(
        &self,
        _req: RunStreamRequest,
        sender: StreamSender,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut tick = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
            sender
                .send_json(json!({ "tick": tick, "version": self.version }))
                .await?;
            tick += 1;
        }
    }
}

pub fn test_factory(probe: Arc<BackendProbe>) -> BackendFactoryFn {
    Arc::new(move |plugin| {
        let probe = probe.clone();
        async move {
            let delay = *probe.create_delay.lock().unwrap();
            tokio::time::sleep(delay).await;
            probe.created.fetch_add(1, Ordering::SeqCst);
            let exit = probe.exit.lock().unwrap().clone();
            Ok(Arc::new(TestBackend {
                version: plugin.version,
                probe,
                exit,
            }) as Arc<dyn BackendPlugin>)
        }
        .boxed()
    })
}

/// Parks the next backend lookup on its worker thread until released, so a
/// test can act between the registry read and the handle creation.
#[derive(Default)]
pub struct FactoryGate {
    armed: Mutex<Option<(std_mpsc::Sender<()>, std_mpsc::Receiver<()>)>>,
}

pub struct GateKeys {
    entered: std_mpsc::Receiver<()>,
    release: std_mpsc::Sender<()>,
}

impl GateKeys {
    /// Waits until a dispatch is parked at the gate.
    pub async fn entered(self) -> std_mpsc::Sender<()> {
        let GateKeys { entered, release } = self;
        tokio::task::spawn_blocking(move || entered.recv())
            .await
            .unwrap()
            .unwrap();
        release
    }
}

impl FactoryGate {
    pub fn arm(&self) -> GateKeys {
        let (entered_tx, entered_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        *self.armed.lock().unwrap() = Some((entered_tx, release_rx));
        GateKeys {
            entered: entered_rx,
            release: release_tx,
        }
    }

    fn pass(&self) {
        let armed = self.armed.lock().unwrap().take();
        if let Some((entered, release)) = armed {
            let _ = entered.send(());
            let _ = release.recv();
        }
    }
}

struct GatedProvider {
    inner: Arc<DefaultBackendProvider>,
    gate: Arc<FactoryGate>,
}

impl BackendFactoryProvider for GatedProvider {
    fn backend_factory(&self, plugin: &PluginDto) -> Option<BackendFactoryFn> {
        self.gate.pass();
        self.inner.backend_factory(plugin)
    }
}

pub struct TestHost {
    pub host: PluginHost,
    pub provider: Arc<DefaultBackendProvider>,
    pub gate: Arc<FactoryGate>,
    pub updates: Arc<StaticUpdateSource>,
    pub dir: Arc<TempDir>,
    pub db: sled::Db,
}

impl TestHost {
    pub fn new() -> Self {
        let dir = Arc::new(tempfile::tempdir().unwrap());
        let db = sled::Config::new().temporary(true).open().unwrap();
        Self::with_storage(dir, db)
    }

    /// Host over existing storage, as after a restart.
    pub fn with_storage(dir: Arc<TempDir>, db: sled::Db) -> Self {
        let mut config = NovaConfig::default();
        config.plugins.plugins_dir = dir.path().join("plugins");
        config.plugins.core_dirs = vec![dir.path().join("core")];
        config.backend.shutdown_timeout_ms = 200;
        config.backend.health_check_timeout_ms = 100;
        config.backend.start_timeout_ms = 1_000;

        let provider = Arc::new(DefaultBackendProvider::new(config.backend.start_timeout()));
        let updates = Arc::new(StaticUpdateSource::default());
        let ledger = InstallLedger::new(db.open_tree("plugin_installs").unwrap());
        let gate = Arc::new(FactoryGate::default());
        let gated = Arc::new(GatedProvider {
            inner: provider.clone(),
            gate: gate.clone(),
        });
        let host = PluginHost::new(&config, gated, updates.clone(), ledger);
        Self {
            host,
            provider,
            gate,
            updates,
            dir,
            db,
        }
    }

    /// Registers an in-process backend for `plugin_id` and returns its probe.
    pub fn backend(&self, plugin_id: &str) -> Arc<BackendProbe> {
        let probe = Arc::new(BackendProbe::default());
        self.provider
            .register_factory(plugin_id, test_factory(probe.clone()));
        probe
    }

    pub async fn install(&self, plugin_id: &str, version: &str) {
        self.updates.publish_plugin(plugin_id, version);
        self.host
            .manager()
            .add(&nova_plugins::CallContext::new(), plugin_id, version)
            .await
            .unwrap();
    }

    pub fn core_dir(&self) -> PathBuf {
        self.dir.path().join("core")
    }

    pub fn external_source(&self) -> PluginSource {
        PluginSource {
            class: PluginClass::External,
            paths: vec![self.dir.path().join("plugins")],
        }
    }

    pub fn core_source(&self) -> PluginSource {
        PluginSource {
            class: PluginClass::Core,
            paths: vec![self.core_dir()],
        }
    }
}

pub fn plugin_context(plugin_id: &str) -> PluginContext {
    PluginContext {
        org_id: 1,
        plugin_id: plugin_id.to_string(),
        ..Default::default()
    }
}

pub fn data_query(ref_id: &str, model: Value) -> DataQuery {
    let now = Utc::now();
    DataQuery {
        ref_id: ref_id.to_string(),
        query_type: String::new(),
        max_data_points: 100,
        interval_ms: 1_000,
        time_range: TimeRange {
            from: now - chrono::Duration::hours(1),
            to: now,
        },
        json: model,
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

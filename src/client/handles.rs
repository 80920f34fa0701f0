use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Notify, OnceCell};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendFactoryFn, BackendPlugin};
use crate::error::{NovaError, Result};
use crate::plugins::PluginDto;

/// Why a backend handle stopped accepting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer version of the plugin was installed.
    Superseded,
    Disabled,
    Removed,
    /// The backend process went away on its own.
    Exited,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseReason::Superseded => "superseded",
            CloseReason::Disabled => "disabled",
            CloseReason::Removed => "removed",
            CloseReason::Exited => "exited",
            CloseReason::Shutdown => "shutdown",
        })
    }
}

/// A started backend for one version of one plugin.
pub struct BackendHandle {
    plugin_id: String,
    version: String,
    generation: u64,
    backend: Arc<dyn BackendPlugin>,
    closed: OnceLock<CloseReason>,
    /// Fires when the handle stops taking new work.
    closing: CancellationToken,
    /// Fires when in-flight work must give up.
    abort: CancellationToken,
    /// Fires once the close has run its course.
    settled: CancellationToken,
    removal_rolled_back: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl BackendHandle {
    fn new(plugin: &PluginDto, generation: u64, backend: Arc<dyn BackendPlugin>) -> Self {
        Self {
            plugin_id: plugin.id.clone(),
            version: plugin.version.clone(),
            generation,
            backend,
            closed: OnceLock::new(),
            closing: CancellationToken::new(),
            abort: CancellationToken::new(),
            settled: CancellationToken::new(),
            removal_rolled_back: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn backend(&self) -> Arc<dyn BackendPlugin> {
        self.backend.clone()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.get().copied()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Registers one in-flight operation; `None` once the handle is closed.
    pub fn enter(self: &Arc<Self>) -> Option<InFlightGuard> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            self.leave();
            return None;
        }
        Some(InFlightGuard {
            handle: self.clone(),
        })
    }

    fn leave(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub async fn closing(&self) {
        self.closing.cancelled().await
    }

    pub async fn aborted(&self) {
        self.abort.cancelled().await
    }

    /// True when the removal that closed this handle timed out and the
    /// plugin stayed installed.
    pub fn removal_rolled_back(&self) -> bool {
        self.removal_rolled_back.load(Ordering::SeqCst)
    }

    /// Waits until a removal that closed this handle has either gone through
    /// or been rolled back. Returns at once for every other close reason.
    /// Callers must not hold an [`InFlightGuard`] while waiting.
    pub async fn removal_settled(&self) {
        if self.close_reason() == Some(CloseReason::Removed) {
            self.settled.cancelled().await;
        }
    }

    /// Error for an operation the close cut short, once the outcome of a
    /// pending removal is known.
    pub async fn interrupted_error(&self) -> NovaError {
        self.removal_settled().await;
        self.closed_error()
    }

    /// Error reported to operations interrupted by the close.
    pub fn closed_error(&self) -> NovaError {
        match self.close_reason() {
            Some(CloseReason::Removed) if self.removal_rolled_back() => {
                NovaError::backend_unavailable(&self.plugin_id, "plugin removal was rolled back")
            }
            Some(CloseReason::Removed) => NovaError::plugin_removed(&self.plugin_id),
            Some(CloseReason::Disabled) => NovaError::plugin_disabled(&self.plugin_id),
            Some(CloseReason::Exited) => {
                NovaError::backend_unavailable(&self.plugin_id, "backend exited")
            }
            Some(reason) => NovaError::backend_unavailable(
                &self.plugin_id,
                format!("backend handle {}", reason),
            ),
            None => NovaError::backend_unavailable(&self.plugin_id, "backend handle closed"),
        }
    }

    /// Marks the handle closed. Returns false when it already was.
    fn close(&self, reason: CloseReason) -> bool {
        if self.closed.set(reason).is_err() {
            return false;
        }
        self.closing.cancel();
        if reason == CloseReason::Exited {
            self.abort.cancel();
        }
        true
    }

    fn settle(&self, rolled_back: bool) {
        self.removal_rolled_back.store(rolled_back, Ordering::SeqCst);
        self.settled.cancel();
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Drains and stops a closed handle within `timeout`. In-flight work gets
    /// half the budget to finish before it is aborted.
    async fn teardown(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let grace = timeout / 2;
        if tokio::time::timeout(grace, self.wait_idle()).await.is_err() {
            debug!(
                plugin_id = %self.plugin_id,
                in_flight = self.in_flight(),
                "Aborting in-flight operations"
            );
            self.abort.cancel();
        }
        let remaining = timeout.saturating_sub(started.elapsed());
        let stopped = tokio::time::timeout(remaining, async {
            self.wait_idle().await;
            self.backend.stop().await
        })
        .await;
        self.abort.cancel();

        match stopped {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                warn!(plugin_id = %self.plugin_id, "Backend stop failed: {}", err);
                Ok(())
            }
            Err(_) => Err(NovaError::in_use(
                &self.plugin_id,
                format!(
                    "{} operation(s) still running after {:?}",
                    self.in_flight(),
                    timeout
                ),
            )),
        }
    }

    async fn finish_teardown(&self) {
        self.wait_idle().await;
        if let Err(err) = self.backend.stop().await {
            warn!(plugin_id = %self.plugin_id, "Backend stop failed: {}", err);
        }
    }
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("plugin_id", &self.plugin_id)
            .field("version", &self.version)
            .field("generation", &self.generation)
            .field("closed", &self.close_reason())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Keeps a handle busy; dropping it lets a pending teardown proceed.
#[derive(Debug)]
pub struct InFlightGuard {
    handle: Arc<BackendHandle>,
}

impl InFlightGuard {
    pub fn handle(&self) -> &Arc<BackendHandle> {
        &self.handle
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.handle.leave();
    }
}

type Slot = Arc<OnceCell<Arc<BackendHandle>>>;

/// Live backend handles, at most one per plugin ID.
pub struct HandleTable {
    slots: Arc<DashMap<String, Slot>>,
    next_generation: AtomicU64,
    shutdown_timeout: Duration,
}

impl HandleTable {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
            shutdown_timeout,
        }
    }

    pub fn current(&self, plugin_id: &str) -> Option<Arc<BackendHandle>> {
        self.slots
            .get(plugin_id)
            .and_then(|slot| slot.get().cloned())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns the live handle for `plugin`, creating it through `factory`
    /// when there is none. Concurrent callers share one creation. `None`
    /// means the handle found was stale and the caller should resolve again.
    pub async fn try_acquire(
        &self,
        plugin: &PluginDto,
        factory: BackendFactoryFn,
    ) -> Result<Option<Arc<BackendHandle>>> {
        let slot: Slot = self
            .slots
            .entry(plugin.id.clone())
            .or_default()
            .clone();

        let handle = slot
            .get_or_try_init(|| self.create(plugin, factory))
            .await?
            .clone();

        let attached = self
            .slots
            .get(&plugin.id)
            .map(|current| Arc::ptr_eq(current.value(), &slot))
            .unwrap_or(false);
        if !attached {
            // retired while the backend was starting
            self.spawn_teardown(handle, CloseReason::Superseded);
            return Ok(None);
        }
        if handle.is_closed() {
            self.detach(&plugin.id, &slot);
            return Ok(None);
        }
        if handle.version() != plugin.version {
            if self.detach(&plugin.id, &slot) {
                info!(
                    plugin_id = %plugin.id,
                    from = handle.version(),
                    to = %plugin.version,
                    "Replacing stale backend handle"
                );
                self.spawn_teardown(handle, CloseReason::Superseded);
            }
            return Ok(None);
        }
        Ok(Some(handle))
    }

    async fn create(&self, plugin: &PluginDto, factory: BackendFactoryFn) -> Result<Arc<BackendHandle>> {
        let backend = factory(plugin.clone())
            .await
            .map_err(|err| into_unavailable(&plugin.id, err))?;
        backend
            .start()
            .await
            .map_err(|err| into_unavailable(&plugin.id, err))?;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(BackendHandle::new(plugin, generation, backend));
        info!(
            plugin_id = %plugin.id,
            version = %plugin.version,
            generation,
            "Backend started"
        );
        self.watch_exit(handle.clone());
        Ok(handle)
    }

    /// Invalidates the handle when its backend exits on its own.
    fn watch_exit(&self, handle: Arc<BackendHandle>) {
        let slots = self.slots.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = handle.backend.exited() => {
                    if handle.close(CloseReason::Exited) {
                        warn!(
                            plugin_id = %handle.plugin_id,
                            generation = handle.generation,
                            "Backend exited, handle invalidated"
                        );
                        slots.remove_if(&handle.plugin_id, |_, slot| {
                            slot.get().map(|h| Arc::ptr_eq(h, &handle)).unwrap_or(false)
                        });
                        handle.finish_teardown().await;
                        handle.settle(false);
                    }
                }
                _ = handle.closing.cancelled() => {}
            }
        });
    }

    fn detach(&self, plugin_id: &str, slot: &Slot) -> bool {
        self.slots
            .remove_if(plugin_id, |_, current| Arc::ptr_eq(current, slot))
            .is_some()
    }

    fn take(&self, plugin_id: &str) -> Option<Arc<BackendHandle>> {
        self.slots
            .remove(plugin_id)
            .and_then(|(_, slot)| slot.get().cloned())
    }

    /// Detaches `handle` if it is still the plugin's current one and tears
    /// it down in the background.
    pub(crate) fn discard(&self, handle: &Arc<BackendHandle>, reason: CloseReason) {
        self.slots.remove_if(&handle.plugin_id, |_, slot| {
            slot.get().map(|h| Arc::ptr_eq(h, handle)).unwrap_or(false)
        });
        self.spawn_teardown(handle.clone(), reason);
    }

    /// Detaches the plugin's handle and tears it down in the background.
    pub fn retire(&self, plugin_id: &str, reason: CloseReason) {
        if let Some(handle) = self.take(plugin_id) {
            self.spawn_teardown(handle, reason);
        }
    }

    fn spawn_teardown(&self, handle: Arc<BackendHandle>, reason: CloseReason) {
        if !handle.close(reason) {
            return;
        }
        let timeout = self.shutdown_timeout;
        tokio::spawn(async move {
            if let Err(err) = handle.teardown(timeout).await {
                warn!(plugin_id = %handle.plugin_id, "Backend teardown overran: {}", err);
                handle.finish_teardown().await;
            }
            handle.settle(false);
            debug!(plugin_id = %handle.plugin_id, %reason, "Backend handle retired");
        });
    }

    /// Closes the plugin's handle and waits for it to drain and stop.
    /// Fails with `InUse` when that takes longer than `timeout`; the drain
    /// then carries on in the background and a removal counts as rolled back.
    pub async fn shutdown(&self, plugin_id: &str, reason: CloseReason, timeout: Duration) -> Result<()> {
        let Some(handle) = self.take(plugin_id) else {
            return Ok(());
        };
        if !handle.close(reason) {
            return Ok(());
        }
        match handle.teardown(timeout).await {
            Ok(()) => {
                handle.settle(false);
                debug!(plugin_id, %reason, "Backend handle shut down");
                Ok(())
            }
            Err(err) => {
                handle.settle(reason == CloseReason::Removed);
                tokio::spawn(async move { handle.finish_teardown().await });
                Err(err)
            }
        }
    }

    pub async fn shutdown_all(&self, timeout: Duration) {
        let ids: Vec<String> = self.slots.iter().map(|slot| slot.key().clone()).collect();
        let shutdowns = ids
            .iter()
            .map(|id| self.shutdown(id, CloseReason::Shutdown, timeout));
        for (id, result) in ids.iter().zip(futures::future::join_all(shutdowns).await) {
            if let Err(err) = result {
                warn!(plugin_id = %id, "Backend did not shut down cleanly: {}", err);
            }
        }
    }
}

fn into_unavailable(plugin_id: &str, err: NovaError) -> NovaError {
    match err {
        err @ NovaError::BackendUnavailable { .. } => err,
        other => NovaError::backend_unavailable(plugin_id, other.to_string()),
    }
}

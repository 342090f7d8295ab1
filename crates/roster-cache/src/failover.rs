//! Auto-failover decorator over the concrete cache strategies.
//!
//! Policy: prefer the remote backend while its health check passes; otherwise
//! use the local instance, provisioning it once per outage if it is not
//! running. With nothing reachable the cache reports [`ActiveBackend::Degraded`]
//! and every call fails fast with `CacheError::Unavailable` until a backend
//! comes back. Re-probing is driven by [`FailoverCache::refresh`], which
//! [`FailoverCache::spawn_monitor`] schedules at a fixed interval.
//!
//! Calls delegated to a backend are bounded by the probe timeout. Callers
//! that queue behind an in-flight resolution reuse its outcome, so a burst
//! during an outage waits for one round of health checks, not one per caller.

use crate::backend::{BackendKind, CacheBackend, CacheError};
use crate::provision::Provision;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// While degraded, calls within this window of the last resolution attempt
/// fail immediately instead of probing again.
const DEFAULT_DEGRADED_RETRY: Duration = Duration::from_secs(1);

/// Which backend currently serves requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveBackend {
    Remote,
    Local,
    Memory,
    Degraded,
}

impl ActiveBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActiveBackend::Remote => "remote",
            ActiveBackend::Local => "local",
            ActiveBackend::Memory => "memory",
            ActiveBackend::Degraded => "degraded",
        }
    }
}

impl From<BackendKind> for ActiveBackend {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Remote => ActiveBackend::Remote,
            BackendKind::Local => ActiveBackend::Local,
            BackendKind::Memory => ActiveBackend::Memory,
        }
    }
}

/// Backend selection policy from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Auto,
    Remote,
    Local,
    Memory,
}

impl CacheMode {
    /// Unknown values fall back to `Auto`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" | "upstash_rest" => CacheMode::Remote,
            "local" | "redis" => CacheMode::Local,
            "memory" => CacheMode::Memory,
            _ => CacheMode::Auto,
        }
    }
}

struct Selection {
    backend: Option<Arc<dyn CacheBackend>>,
    last_attempt: Option<Instant>,
}

pub struct FailoverCache {
    remote: Option<Arc<dyn CacheBackend>>,
    local: Option<Arc<dyn CacheBackend>>,
    provisioner: Option<Arc<dyn Provision>>,
    selection: RwLock<Selection>,
    /// Serializes resolution so one outage triggers one probe/provision round.
    resolving: tokio::sync::Mutex<()>,
    /// Bumped whenever a resolution completes. Callers that queued behind a
    /// resolution reuse its outcome instead of probing again.
    generation: AtomicU64,
    provision_attempted: AtomicBool,
    probe_timeout: Duration,
    degraded_retry: Duration,
}

impl FailoverCache {
    pub fn new(
        remote: Option<Arc<dyn CacheBackend>>,
        local: Option<Arc<dyn CacheBackend>>,
        provisioner: Option<Arc<dyn Provision>>,
    ) -> Self {
        Self {
            remote,
            local,
            provisioner,
            selection: RwLock::new(Selection {
                backend: None,
                last_attempt: None,
            }),
            resolving: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            provision_attempted: AtomicBool::new(false),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            degraded_retry: DEFAULT_DEGRADED_RETRY,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_degraded_retry(mut self, retry: Duration) -> Self {
        self.degraded_retry = retry;
        self
    }

    pub fn active(&self) -> ActiveBackend {
        self.selection
            .read()
            .backend
            .as_ref()
            .map(|b| ActiveBackend::from(b.kind()))
            .unwrap_or(ActiveBackend::Degraded)
    }

    fn current(&self) -> Option<Arc<dyn CacheBackend>> {
        self.selection.read().backend.clone()
    }

    fn select(&self, backend: Option<Arc<dyn CacheBackend>>) {
        let previous = self.active();
        let mut sel = self.selection.write();
        sel.backend = backend;
        sel.last_attempt = Some(Instant::now());
        self.generation.fetch_add(1, Ordering::SeqCst);
        let now = sel
            .backend
            .as_ref()
            .map(|b| ActiveBackend::from(b.kind()))
            .unwrap_or(ActiveBackend::Degraded);
        drop(sel);

        if now != previous {
            match now {
                ActiveBackend::Degraded => {
                    tracing::error!(previous = previous.as_str(), "no cache backend reachable; gate degraded")
                }
                _ => tracing::info!(backend = now.as_str(), previous = previous.as_str(), "cache backend selected"),
            }
        }
        if now != ActiveBackend::Degraded {
            self.provision_attempted.store(false, Ordering::SeqCst);
        }
    }

    async fn probe(&self, backend: &Arc<dyn CacheBackend>) -> bool {
        match tokio::time::timeout(self.probe_timeout, backend.health_check()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(backend = %backend.kind(), error = %e, "cache health check failed");
                false
            }
            Err(_) => {
                tracing::warn!(backend = %backend.kind(), "cache health check timed out");
                false
            }
        }
    }

    /// Run a delegated backend call under the probe timeout.
    async fn bounded<T>(
        &self,
        backend: &Arc<dyn CacheBackend>,
        call: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        match tokio::time::timeout(self.probe_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Unavailable(format!(
                "{} cache did not answer within {:?}",
                backend.kind(),
                self.probe_timeout
            ))),
        }
    }

    /// Pick the best reachable backend, provisioning the local one if allowed.
    pub async fn resolve(&self) -> Option<Arc<dyn CacheBackend>> {
        let _guard = self.resolving.lock().await;
        self.resolve_locked().await
    }

    /// Resolve on behalf of a request. If another resolution finished while
    /// this caller waited for the lock, its outcome is reused.
    async fn resolve_after(&self, seen: u64) -> Option<Arc<dyn CacheBackend>> {
        let _guard = self.resolving.lock().await;
        if self.generation.load(Ordering::SeqCst) != seen {
            return self.current();
        }
        self.resolve_locked().await
    }

    async fn resolve_locked(&self) -> Option<Arc<dyn CacheBackend>> {
        if let Some(remote) = &self.remote {
            if self.probe(remote).await {
                self.select(Some(remote.clone()));
                return Some(remote.clone());
            }
        }

        if let Some(local) = &self.local {
            if self.probe(local).await {
                self.select(Some(local.clone()));
                return Some(local.clone());
            }
            if let Some(provisioner) = &self.provisioner {
                if !self.provision_attempted.swap(true, Ordering::SeqCst) {
                    match provisioner.provision(local.as_ref()).await {
                        Ok(()) => {
                            self.select(Some(local.clone()));
                            return Some(local.clone());
                        }
                        Err(e) => tracing::warn!(error = %e, "local cache provisioning failed"),
                    }
                }
            }
        }

        self.select(None);
        None
    }

    async fn backend_for_call(&self) -> Result<Arc<dyn CacheBackend>, CacheError> {
        let seen = self.generation.load(Ordering::SeqCst);
        if let Some(backend) = self.current() {
            return Ok(backend);
        }
        let recently_tried = self
            .selection
            .read()
            .last_attempt
            .map(|at| at.elapsed() < self.degraded_retry)
            .unwrap_or(false);
        if recently_tried {
            return Err(CacheError::Unavailable("no cache backend reachable".into()));
        }
        self.resolve_after(seen)
            .await
            .ok_or_else(|| CacheError::Unavailable("no cache backend reachable".into()))
    }

    /// Periodic re-evaluation: return to the remote backend when it is healthy
    /// again, fail over when the active one stopped answering, and retry
    /// resolution while degraded.
    pub async fn refresh(&self) -> ActiveBackend {
        match self.current() {
            Some(active) if active.kind() == BackendKind::Remote => {
                if !self.probe(&active).await {
                    self.resolve().await;
                }
            }
            Some(active) => {
                let remote_back = match &self.remote {
                    Some(remote) => self.probe(remote).await,
                    None => false,
                };
                if remote_back {
                    tracing::info!("remote cache reachable again");
                    self.resolve().await;
                } else if !self.probe(&active).await {
                    self.resolve().await;
                }
            }
            None => {
                self.resolve().await;
            }
        }
        self.active()
    }

    /// Run [`refresh`](Self::refresh) every `interval` until the handle is aborted.
    pub fn spawn_monitor(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let active = self.refresh().await;
                tracing::debug!(backend = active.as_str(), "cache health refreshed");
            }
        })
    }

    pub async fn shutdown(&self) {
        if let Some(provisioner) = &self.provisioner {
            provisioner.shutdown().await;
        }
    }
}

#[async_trait]
impl CacheBackend for FailoverCache {
    fn kind(&self) -> BackendKind {
        self.current().map(|b| b.kind()).unwrap_or(BackendKind::Local)
    }

    async fn try_admit(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let backend = self.backend_for_call().await?;
        let seen = self.generation.load(Ordering::SeqCst);
        match self.bounded(&backend, backend.try_admit(key, ttl)).await {
            Ok(admitted) => Ok(admitted),
            Err(e) => {
                tracing::warn!(backend = %backend.kind(), error = %e, "cache call failed; re-resolving");
                let next = self
                    .resolve_after(seen)
                    .await
                    .ok_or_else(|| CacheError::Unavailable(e.to_string()))?;
                self.bounded(&next, next.try_admit(key, ttl)).await
            }
        }
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        let backend = self.backend_for_call().await?;
        self.bounded(&backend, backend.health_check()).await
    }
}

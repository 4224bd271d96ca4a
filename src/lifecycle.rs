//! Backend instance lifecycle
//!
//! Long-lived processes keep one backend in a [`ConnectionPool`]; serverless
//! processes keep one per configuration fingerprint in an [`EphemeralCache`]
//! with a background sweeper. [`StoreProvider`] owns both and hands out the
//! right one for the deployment mode.

use crate::config::{short_fingerprint, DeploymentMode, LifecycleSettings, StoreConfig};
use crate::error::Result;
use crate::storage::selector::select_backend;
use crate::storage::{BackendKind, StorageBackend};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Builds backend instances for the lifecycle caches
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self, config: &StoreConfig, mode: DeploymentMode) -> Result<Arc<dyn StorageBackend>>;
}

/// Default factory: the configuration-driven selector
pub struct SelectorFactory;

#[async_trait]
impl BackendFactory for SelectorFactory {
    async fn create(&self, config: &StoreConfig, mode: DeploymentMode) -> Result<Arc<dyn StorageBackend>> {
        select_backend(config, mode).await
    }
}

struct CachedBackend {
    backend: Arc<dyn StorageBackend>,
    fingerprint: String,
    has_sql: bool,
    has_rest: bool,
    created_at: Instant,
    last_used: Instant,
}

impl CachedBackend {
    fn new(backend: Arc<dyn StorageBackend>, config: &StoreConfig, fingerprint: String) -> Self {
        let now = Instant::now();
        Self {
            backend,
            fingerprint,
            has_sql: config.has_sql(),
            has_rest: config.has_rest(),
            created_at: now,
            last_used: now,
        }
    }

    fn idle(&self) -> Duration {
        self.last_used.elapsed()
    }
}

async fn close_quietly(backend: &Arc<dyn StorageBackend>) {
    if let Err(e) = backend.close().await {
        warn!("Failed to close {} backend: {}", backend.backend_kind(), e);
    }
}

/// Occupancy of the long-lived pool
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    pub active: bool,
    pub backend: Option<BackendKind>,
    pub fingerprint: Option<String>,
    pub idle: Option<Duration>,
    pub age: Option<Duration>,
    pub has_sql: bool,
    pub has_rest: bool,
}

/// Single cached backend for long-lived processes
pub struct ConnectionPool {
    factory: Arc<dyn BackendFactory>,
    settings: LifecycleSettings,
    slot: Mutex<Option<CachedBackend>>,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn BackendFactory>, settings: LifecycleSettings) -> Self {
        Self {
            factory,
            settings,
            slot: Mutex::new(None),
        }
    }

    /// Return the cached backend, replacing it when the configuration
    /// changed, it sat idle too long, or it fails its health check
    pub async fn acquire(&self, config: &StoreConfig) -> Result<Arc<dyn StorageBackend>> {
        let fingerprint = config.fingerprint();
        let mut slot = self.slot.lock().await;

        if let Some(cached) = slot.as_mut() {
            let stale = if cached.fingerprint != fingerprint {
                Some("configuration changed".to_string())
            } else if cached.idle() > self.settings.recreate_after_idle() {
                Some(format!("idle for {:?}", cached.idle()))
            } else {
                match cached.backend.health_check().await {
                    Ok(()) => None,
                    Err(e) => Some(format!("health check failed: {}", e)),
                }
            };

            match stale {
                None => {
                    cached.last_used = Instant::now();
                    return Ok(cached.backend.clone());
                }
                Some(reason) => {
                    info!(
                        "Recreating {} backend {}: {}",
                        cached.backend.backend_kind(),
                        short_fingerprint(&cached.fingerprint),
                        reason
                    );
                    close_quietly(&cached.backend).await;
                    *slot = None;
                }
            }
        }

        let backend = self.factory.create(config, DeploymentMode::LongLived).await?;
        info!(
            "Created {} backend {}",
            backend.backend_kind(),
            short_fingerprint(&fingerprint)
        );
        *slot = Some(CachedBackend::new(backend.clone(), config, fingerprint));
        Ok(backend)
    }

    /// Close and drop the instance if it has been idle too long
    ///
    /// An instance that stays has its idle connections trimmed instead.
    pub async fn cleanup_idle(&self) -> bool {
        let mut slot = self.slot.lock().await;
        let expired = match slot.as_ref() {
            Some(cached) if cached.idle() > self.settings.cleanup_idle() => true,
            Some(cached) => {
                release_idle(cached);
                false
            }
            None => false,
        };
        if !expired {
            return false;
        }
        if let Some(cached) = slot.take() {
            info!(
                "Dropping idle {} backend {} after {:?}",
                cached.backend.backend_kind(),
                short_fingerprint(&cached.fingerprint),
                cached.idle()
            );
            close_quietly(&cached.backend).await;
        }
        true
    }

    pub async fn force_cleanup(&self) {
        if let Some(cached) = self.slot.lock().await.take() {
            close_quietly(&cached.backend).await;
            info!("Connection pool cleared");
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(cached) => PoolStats {
                active: true,
                backend: Some(cached.backend.backend_kind()),
                fingerprint: Some(short_fingerprint(&cached.fingerprint).to_string()),
                idle: Some(cached.idle()),
                age: Some(cached.created_at.elapsed()),
                has_sql: cached.has_sql,
                has_rest: cached.has_rest,
            },
            None => PoolStats {
                active: false,
                backend: None,
                fingerprint: None,
                idle: None,
                age: None,
                has_sql: false,
                has_rest: false,
            },
        }
    }
}

/// One cached entry of the ephemeral cache
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntryStats {
    pub fingerprint: String,
    pub backend: BackendKind,
    pub idle: Duration,
    pub age: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub entries: Vec<CacheEntryStats>,
    pub sweeper_running: bool,
}

type Entries = Arc<Mutex<HashMap<String, CachedBackend>>>;

fn release_idle(cached: &CachedBackend) {
    let released = cached.backend.release_idle();
    if released > 0 {
        debug!(
            "Released {} idle connections of backend {}",
            released,
            short_fingerprint(&cached.fingerprint)
        );
    }
}

async fn sweep_entries(entries: &Entries, max_idle: Duration) -> usize {
    let mut map = entries.lock().await;
    let expired: Vec<String> = map
        .iter()
        .filter(|(_, cached)| cached.idle() > max_idle)
        .map(|(key, _)| key.clone())
        .collect();

    for key in &expired {
        if let Some(cached) = map.remove(key) {
            debug!("Evicting idle backend {}", short_fingerprint(key));
            close_quietly(&cached.backend).await;
        }
    }
    if !expired.is_empty() {
        info!("Swept {} idle backends, {} remain", expired.len(), map.len());
    }
    map.values().for_each(release_idle);
    expired.len()
}

/// Per-fingerprint backend cache for serverless processes
pub struct EphemeralCache {
    factory: Arc<dyn BackendFactory>,
    settings: LifecycleSettings,
    entries: Entries,
    shutdown_tx: broadcast::Sender<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl EphemeralCache {
    pub fn new(factory: Arc<dyn BackendFactory>, settings: LifecycleSettings) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            factory,
            settings,
            entries: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
            sweeper: Mutex::new(None),
        }
    }

    /// Cached backend for this configuration; stale or unhealthy entries are
    /// closed and rebuilt under the same key
    pub async fn acquire(&self, config: &StoreConfig) -> Result<Arc<dyn StorageBackend>> {
        let fingerprint = config.fingerprint();
        let mut map = self.entries.lock().await;

        if let Some(cached) = map.get_mut(&fingerprint) {
            let evict = if cached.idle() > self.settings.ephemeral_idle() {
                Some(format!("idle for {:?}", cached.idle()))
            } else {
                match cached.backend.health_check().await {
                    Ok(()) => None,
                    Err(e) => Some(format!("health check failed: {}", e)),
                }
            };

            match evict {
                None => {
                    cached.last_used = Instant::now();
                    return Ok(cached.backend.clone());
                }
                Some(reason) => {
                    warn!("Evicting backend {}: {}", short_fingerprint(&fingerprint), reason);
                    if let Some(old) = map.remove(&fingerprint) {
                        close_quietly(&old.backend).await;
                    }
                }
            }
        }

        let backend = self.factory.create(config, DeploymentMode::Ephemeral).await?;
        debug!(
            "Cached {} backend {}",
            backend.backend_kind(),
            short_fingerprint(&fingerprint)
        );
        map.insert(
            fingerprint.clone(),
            CachedBackend::new(backend.clone(), config, fingerprint),
        );
        Ok(backend)
    }

    /// Close and drop entries idle longer than the configured limit
    pub async fn sweep(&self) -> usize {
        sweep_entries(&self.entries, self.settings.ephemeral_idle()).await
    }

    /// Spawn the periodic sweep; no-op when already running
    pub async fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let entries = self.entries.clone();
        let max_idle = self.settings.ephemeral_idle();
        let period = self.settings.sweep_interval().max(Duration::from_secs(1));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        sweep_entries(&entries, max_idle).await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Sweeper received shutdown signal");
                        break;
                    }
                }
            }
        }));
        info!("Started backend sweeper (every {:?})", period);
    }

    /// Stop the sweeper and close every cached backend
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.sweeper.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Sweeper task ended abnormally: {}", e);
            }
        }
        self.force_cleanup().await;
    }

    pub async fn force_cleanup(&self) {
        let drained: Vec<CachedBackend> = self.entries.lock().await.drain().map(|(_, v)| v).collect();
        for cached in &drained {
            close_quietly(&cached.backend).await;
        }
        if !drained.is_empty() {
            info!("Closed {} cached backends", drained.len());
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self
            .entries
            .lock()
            .await
            .values()
            .map(|cached| CacheEntryStats {
                fingerprint: short_fingerprint(&cached.fingerprint).to_string(),
                backend: cached.backend.backend_kind(),
                idle: cached.idle(),
                age: cached.created_at.elapsed(),
            })
            .collect();
        let sweeper_running = self
            .sweeper
            .lock()
            .await
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        CacheStats {
            entries,
            sweeper_running,
        }
    }
}

/// Snapshot of both caches
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderStats {
    pub mode: DeploymentMode,
    pub pool: PoolStats,
    pub cache: CacheStats,
}

/// Composition root: configuration, deployment mode and the backend caches
pub struct StoreProvider {
    config: StoreConfig,
    mode: DeploymentMode,
    pool: ConnectionPool,
    cache: EphemeralCache,
}

impl StoreProvider {
    pub fn new(config: StoreConfig, mode: DeploymentMode) -> Self {
        Self::with_factory(config, mode, Arc::new(SelectorFactory))
    }

    pub fn with_factory(config: StoreConfig, mode: DeploymentMode, factory: Arc<dyn BackendFactory>) -> Self {
        let settings = config.lifecycle.clone();
        Self {
            pool: ConnectionPool::new(factory.clone(), settings.clone()),
            cache: EphemeralCache::new(factory, settings),
            config,
            mode,
        }
    }

    /// Use `config` with the deployment mode detected from the environment
    pub fn from_config(config: StoreConfig) -> Self {
        let mode = DeploymentMode::detect();
        info!("Storage provider in {} mode", mode);
        Self::new(config, mode)
    }

    /// Load configuration and detect the deployment mode from the environment
    pub fn from_env(config_path: Option<&Path>) -> Result<Self> {
        Ok(Self::from_config(StoreConfig::load(config_path)?))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    /// Start background maintenance; only ephemeral mode runs a sweeper
    pub async fn start(&self) {
        if self.mode.is_ephemeral() {
            self.cache.start_sweeper().await;
        }
    }

    /// Backend for the provider's own configuration
    pub async fn backend(&self) -> Result<Arc<dyn StorageBackend>> {
        self.backend_with(&self.config).await
    }

    /// Backend for an explicit configuration
    pub async fn backend_with(&self, config: &StoreConfig) -> Result<Arc<dyn StorageBackend>> {
        match self.mode {
            DeploymentMode::LongLived => self.pool.acquire(config).await,
            DeploymentMode::Ephemeral => self.cache.acquire(config).await,
        }
    }

    /// Drop idle instances now instead of waiting for the sweeper
    pub async fn cleanup_idle(&self) -> usize {
        match self.mode {
            DeploymentMode::LongLived => usize::from(self.pool.cleanup_idle().await),
            DeploymentMode::Ephemeral => self.cache.sweep().await,
        }
    }

    pub async fn stats(&self) -> ProviderStats {
        ProviderStats {
            mode: self.mode,
            pool: self.pool.stats().await,
            cache: self.cache.stats().await,
        }
    }

    /// Stop background work and close every backend
    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
        self.pool.force_cleanup().await;
        info!("Storage provider shut down");
    }
}
